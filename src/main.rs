use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use jammate::ble::{BleConfig, BleTransport};
use jammate::layout::{EffectLayoutProvider, LayoutTable};
use jammate::parse::interpret;
use jammate::protocol;
use jammate::session::{SendOutcome, Session, SessionConfig, SessionHandle};
use jammate::types::{ConnectionStatus, DeviceListEntry, Inbound, JamEvent};

/// Optional path to a JSON layout table (`{"tabs":[…]}`).
const LAYOUT_ENV: &str = "JAMMATE_LAYOUT";

fn load_layout() -> Result<LayoutTable> {
    match std::env::var(LAYOUT_ENV) {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading layout table {path}"))?;
            let table = LayoutTable::from_json(&json)
                .with_context(|| format!("parsing layout table {path}"))?;
            info!("Loaded layout table from {path}");
            Ok(table)
        }
        Err(_) => Ok(LayoutTable::builtin()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    //   RUST_LOG=jammate=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let layout = Arc::new(load_layout()?);

    // ── Connect ───────────────────────────────────────────────────────────────
    info!("Connecting to JamMate …");
    let transport = BleTransport::new(BleConfig::default());
    let (mut rx, handle) = Session::start(transport, SessionConfig::default()).await?;
    if let Some(name) = handle.transport().device_name().await {
        info!("Device: {name}");
    }

    info!("Commands (type + Enter):");
    info!("  q                  – quit");
    info!("  s                  – request current state");
    info!("  l <bank> <slot>    – load preset");
    info!("  p <fx> <idx> <val> – set flat parameter");
    info!("  t <fx> <0|1>       – enable / bypass effect");
    info!("  sync <0|1>         – syncing gate");
    info!("  cfg                – upload layout table");
    info!("  flash | reset | sd | save-sd | midi\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on an OS thread so the StdinLock never crosses an await.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle_cmd = handle.clone();
    let layout_cmd = Arc::clone(&layout);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            if line == "q" {
                info!("Quit requested.");
                handle_cmd.disconnect().await;
                break;
            }
            match command_frame(&line, &handle_cmd, &layout_cmd) {
                Ok(Some(frame)) => report(handle_cmd.send(&frame).await),
                Ok(None) => {}
                Err(msg) => error!("{msg}"),
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = rx.recv().await {
        match event {
            JamEvent::Status(ConnectionStatus::Disconnected) => {
                info!("❌  Disconnected.");
                break;
            }
            JamEvent::Status(ConnectionStatus::ReconnectFailed { attempts }) => {
                error!("Gave up after {attempts} reconnect attempts.");
            }
            JamEvent::Status(status) => info!("{status:?}"),
            JamEvent::Message(msg) => match interpret(&msg, layout.as_ref()) {
                Inbound::State(state) | Inbound::Preset(state) => {
                    println!(
                        "preset \"{}\" v{}  bpm={} master={}  enabled={} eq_bands={}",
                        state.name,
                        state.version,
                        state.bpm,
                        state.master_volume,
                        state.effects.values().filter(|fx| fx.enabled).count(),
                        state.eq_bands.len()
                    );
                    for (id, fx) in &state.effects {
                        let name = effect_name(layout.as_ref(), *id);
                        println!(
                            "  {id:>2} {name:<5} {} knobs={:?} dropdowns={:?}",
                            if fx.enabled { "ON " } else { "off" },
                            fx.knobs.values().collect::<Vec<_>>(),
                            fx.dropdowns.values().collect::<Vec<_>>()
                        );
                    }
                }
                Inbound::Tuner(hz) => println!("tuner {hz:>8.2} Hz"),
                Inbound::NamModel(entry) => print_list_entry("NAM", entry),
                Inbound::IrFile(entry) => print_list_entry("IR", entry),
                Inbound::Other(msg) => {
                    println!("0x{:02x} {:02x?}", msg.command, msg.payload)
                }
            },
        }
    }

    Ok(())
}

/// Short tab name of effect `id`, or `"?"` for a slot the table lacks.
fn effect_name(layout: &dyn EffectLayoutProvider, id: u8) -> &str {
    layout.layout(id).map_or("?", |fx| fx.short_name.as_str())
}

fn print_list_entry(kind: &str, entry: DeviceListEntry) {
    match entry {
        DeviceListEntry::Clear => println!("{kind} list cleared"),
        DeviceListEntry::Item { index, name } => println!("{kind} [{index:>3}] {name}"),
    }
}

fn report(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Sent => {}
        SendOutcome::Suppressed => warn!("Not sent: syncing gate is set"),
        SendOutcome::NotConnected => warn!("Not sent: not connected"),
        SendOutcome::Failed => error!("Write failed"),
    }
}

/// Build the frame for one stdin command. `Ok(None)` for local-only commands.
fn command_frame(
    line: &str,
    handle: &SessionHandle<BleTransport>,
    layout: &LayoutTable,
) -> Result<Option<Vec<u8>>, String> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or_default();
    let args: Vec<u8> = words
        .map(|w| w.parse::<u8>().map_err(|_| format!("'{w}' is not a byte value")))
        .collect::<Result<_, _>>()?;

    let frame = match (cmd, args.as_slice()) {
        ("s", []) => protocol::get_state(),
        ("l", [bank, slot]) => protocol::load_request(*bank, *slot),
        ("p", [fx, idx, val]) => protocol::param_update(*fx, *idx, *val),
        ("t", [fx, on]) => protocol::toggle_update(*fx, *on != 0),
        ("sync", [on]) => {
            handle.set_syncing(*on != 0);
            info!("Syncing gate {}", if handle.is_syncing() { "set" } else { "cleared" });
            return Ok(None);
        }
        ("cfg", []) => protocol::config_upload(layout),
        ("flash", []) => protocol::flash_dsp(),
        ("reset", []) => protocol::reset_dsp(),
        ("sd", []) => protocol::read_sd_card(),
        ("save-sd", []) => protocol::save_to_sd(),
        ("midi", []) => protocol::start_midi_scan(),
        _ => return Err(format!("Unknown command: '{line}'")),
    };
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_names_come_from_the_layout() {
        let layout = LayoutTable::builtin();
        assert_eq!(effect_name(&layout, 0), "GATE");
        assert_eq!(effect_name(&layout, 11), "PHAS");
        assert_eq!(effect_name(&layout, 17), "GNRC");
        assert_eq!(effect_name(&layout, 18), "?");
        assert_eq!(effect_name(&layout, 0xFE), "?");
    }
}
