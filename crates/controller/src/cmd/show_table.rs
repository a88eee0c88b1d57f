use anyhow::Context;
use anyhow::Result;

use resource_table::layout;
use resource_table::ResourceTable;

use crate::config::ShowTableArgs;

pub fn run(args: ShowTableArgs) -> Result<()> {
    let table = ResourceTable::attach(&args.table_name)
        .with_context(|| format!("failed to attach resource table `{}`", args.table_name))?;

    let gpu_count = table.gpu_count();
    println!("table `{}`: {gpu_count} GPUs", args.table_name);
    for gpu_index in 0..gpu_count {
        let (word0, word1) = table.read_mask(gpu_index);
        let population = layout::mask_population(word0, word1);
        println!("  gpu {gpu_index}: mask={word1:08x}{word0:08x} ({population} CUs enabled)");
    }

    table.close();
    Ok(())
}
