use std::time::Duration;

use anyhow::Context;
use anyhow::Result;

use crate::config::DaemonArgs;
use crate::daemon::Controller;
use crate::daemon::ControllerSettings;
use crate::device::NvmlAdapter;
use crate::shutdown;

pub fn run(args: DaemonArgs) -> Result<()> {
    shutdown::install_signal_handlers();

    let adapter = NvmlAdapter::init().context("failed to initialize the GPU device library")?;
    let settings = ControllerSettings {
        endpoint: args.channel.endpoint,
        app_name: args.channel.app_name,
        mode: args.channel.mode,
        table_name: args.table_name,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    };

    let mut controller = Controller::new(settings, Box::new(adapter));
    if args.inline {
        controller
            .run_inline(shutdown::requested)
            .context("controller failed")?;
    } else {
        controller.start().context("controller failed to start")?;
        while !shutdown::requested() {
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::info!("shutdown requested");
        controller.stop();
    }
    controller.shutdown();
    Ok(())
}
