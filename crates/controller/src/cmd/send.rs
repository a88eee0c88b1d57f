use anyhow::Context;
use anyhow::Result;

use control_wire::parse_mask_word;
use control_wire::Command;

use crate::client;
use crate::config::SendArgs;
use crate::config::SendCommand;

pub fn run(args: SendArgs) -> Result<()> {
    let command = build(args.command)?;
    client::send_command(
        args.channel.mode,
        &args.channel.endpoint,
        &args.channel.app_name,
        &command,
    )
    .with_context(|| format!("failed to deliver `{command}`"))?;
    Ok(())
}

fn build(command: SendCommand) -> Result<Command> {
    Ok(match command {
        SendCommand::SetPowerCap { gpu, watts } => Command::SetPowerCap {
            gpu_index: gpu,
            watts,
        },
        SendCommand::ResetPowerCap { gpu } => Command::ResetPowerCap { gpu_index: gpu },
        SendCommand::SetCuMask { gpu, word0, word1 } => Command::SetCuMask {
            gpu_index: gpu,
            word0: parse_mask_word(&word0).context("invalid low mask word")?,
            word1: parse_mask_word(&word1).context("invalid high mask word")?,
        },
        SendCommand::ResetCuMask { gpu } => Command::ResetCuMask { gpu_index: gpu },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_mask_command_from_hex_words() {
        let command = build(SendCommand::SetCuMask {
            gpu: 2,
            word0: "ffffffff".to_string(),
            word1: "0fffffff".to_string(),
        })
        .unwrap();
        assert_eq!(
            command,
            Command::SetCuMask {
                gpu_index: 2,
                word0: 0xffff_ffff,
                word1: 0x0fff_ffff,
            }
        );
    }

    #[test]
    fn rejects_short_hex_words() {
        assert!(build(SendCommand::SetCuMask {
            gpu: 0,
            word0: "ffff".to_string(),
            word1: "00000000".to_string(),
        })
        .is_err());
    }
}
