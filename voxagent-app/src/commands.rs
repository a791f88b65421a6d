//! Console command handlers.
//!
//! Each stdin line is parsed into a [`Command`] and run against the shared
//! controller. Lines that are not commands are spoken to the agent as text.

use tracing::info;
use voxagent_core::{list_input_devices, list_output_devices, DeviceInfo, SessionController};

use crate::handler::CallLedger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a session, optionally on a named input device.
    Start(Option<String>),
    Stop,
    Toggle,
    Mute(bool),
    Devices,
    Status,
    Quit,
    /// Free text for the agent.
    Say(String),
    Unknown(String),
}

impl Command {
    /// `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Say(line.to_string()));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };
        Some(match name.to_ascii_lowercase().as_str() {
            "start" => Command::Start(arg.map(str::to_string)),
            "stop" => Command::Stop,
            "toggle" => Command::Toggle,
            "mute" => Command::Mute(true),
            "unmute" => Command::Mute(false),
            "devices" => Command::Devices,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        })
    }
}

/// Whether the console loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub async fn execute(
    controller: &SessionController,
    ledger: &CallLedger,
    command: Command,
) -> Flow {
    match command {
        Command::Start(device) => {
            if let Err(e) = controller.start(device.as_deref()).await {
                println!("start failed: {e}");
            }
        }
        Command::Stop => {
            if let Err(e) = controller.stop().await {
                println!("stop failed: {e}");
            }
        }
        Command::Toggle => {
            if let Err(e) = controller.toggle().await {
                println!("toggle failed: {e}");
            }
        }
        Command::Mute(muted) => {
            controller.mute(muted);
            println!("microphone {}", if muted { "muted" } else { "live" });
        }
        Command::Devices => {
            print_devices("input", &list_input_devices());
            print_devices("output", &list_output_devices());
        }
        Command::Status => {
            let diag = controller.diagnostics_snapshot();
            println!(
                "status: {:?} | muted: {} | {} call(s) pending",
                controller.status(),
                controller.is_muted(),
                ledger.pending()
            );
            for (call_id, record) in ledger.records() {
                println!(
                    "  {call_id} {} [{}] updates={}{}",
                    record.name,
                    record.last_status,
                    record.updates,
                    if record.completed { " done" } else { "" }
                );
            }
            info!(
                frames_captured = diag.frames_captured,
                frames_sent = diag.frames_sent,
                envelopes_received = diag.envelopes_received,
                audio_frames_played = diag.audio_frames_played,
                undecodable_frames = diag.undecodable_frames,
                "session diagnostics"
            );
        }
        Command::Quit => {
            if let Err(e) = controller.stop().await {
                println!("stop failed: {e}");
            }
            return Flow::Quit;
        }
        Command::Say(text) => {
            // A response request follows so the agent answers typed text at once.
            let sent = match controller.send_user_message(text).await {
                Ok(()) => controller.request_response().await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                println!("send failed: {e}");
            }
        }
        Command::Unknown(name) => {
            println!(
                "unknown command /{name}; try /start [device], /stop, /toggle, /mute, \
                 /unmute, /devices, /status, /quit"
            );
        }
    }
    Flow::Continue
}

fn print_devices(label: &str, devices: &[DeviceInfo]) {
    println!("{label} devices:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_recommended {
            tags.push("recommended");
        }
        if device.is_loopback_like {
            tags.push("loopback");
        }
        if tags.is_empty() {
            println!("  {}", device.name);
        } else {
            println!("  {} [{}]", device.name, tags.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_arguments() {
        assert_eq!(Command::parse("/start"), Some(Command::Start(None)));
        assert_eq!(
            Command::parse("  /start USB Microphone (2) "),
            Some(Command::Start(Some("USB Microphone (2)".into())))
        );
        assert_eq!(Command::parse("/MUTE"), Some(Command::Mute(true)));
        assert_eq!(Command::parse("/unmute"), Some(Command::Mute(false)));
        assert_eq!(Command::parse("/exit"), Some(Command::Quit));
        assert_eq!(Command::parse("/status"), Some(Command::Status));
    }

    #[test]
    fn plain_text_is_spoken_and_blank_lines_ignored() {
        assert_eq!(
            Command::parse("what's on my calendar?"),
            Some(Command::Say("what's on my calendar?".into()))
        );
        assert_eq!(Command::parse("   "), None);
        assert_eq!(Command::parse("/dance"), Some(Command::Unknown("dance".into())));
    }
}
