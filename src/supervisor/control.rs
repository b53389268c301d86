//! External control surface for the supervisor.
//!
//! Commands are queued over a channel and consumed by the supervisor loop at
//! its next tick; nothing mutates the pool concurrently. The signal watcher
//! translates the conventional pre-forking server signal set into commands:
//!
//! - SIGHUP: reload configuration (rolling replace)
//! - SIGTERM: graceful shutdown
//! - SIGINT / SIGQUIT: immediate shutdown
//! - SIGTTIN / SIGTTOU: grow / shrink the pool by one
//! - SIGUSR1: dump a pool status snapshot to the log

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, SendError, Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// Command accepted by the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-resolve configuration and perform a rolling replace if needed.
    Reload,
    /// Override the desired worker count immediately.
    Scale(usize),
    /// Increase the desired worker count by one.
    Grow,
    /// Decrease the desired worker count by one.
    Shrink,
    /// Stop the pool. Graceful shutdown drains workers within the grace
    /// period; otherwise they are killed outright.
    Shutdown { graceful: bool },
    /// Log a read-only pool snapshot.
    DumpStatus,
}

/// Sender half of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Command>,
}

impl ControlHandle {
    /// Queue a command for the supervisor's next tick.
    pub fn send(&self, command: Command) -> Result<(), SendError<Command>> {
        self.tx.send(command)
    }
}

/// Create the control channel.
pub fn control_channel() -> (ControlHandle, Receiver<Command>) {
    let (tx, rx) = channel();
    (ControlHandle { tx }, rx)
}

// Pending signals, one bit per command, set from the handler and drained by
// the watcher thread. Signal handlers may only touch async-signal-safe
// state, hence the atomic bitmask instead of the channel.
static PENDING: AtomicU32 = AtomicU32::new(0);

const BIT_RELOAD: u32 = 1 << 0;
const BIT_SHUTDOWN_GRACEFUL: u32 = 1 << 1;
const BIT_SHUTDOWN_NOW: u32 = 1 << 2;
const BIT_GROW: u32 = 1 << 3;
const BIT_SHRINK: u32 = 1 << 4;
const BIT_STATUS: u32 = 1 << 5;

extern "C" fn on_signal(signum: i32) {
    let bit = match Signal::try_from(signum) {
        Ok(Signal::SIGHUP) => BIT_RELOAD,
        Ok(Signal::SIGTERM) => BIT_SHUTDOWN_GRACEFUL,
        Ok(Signal::SIGINT) | Ok(Signal::SIGQUIT) => BIT_SHUTDOWN_NOW,
        Ok(Signal::SIGTTIN) => BIT_GROW,
        Ok(Signal::SIGTTOU) => BIT_SHRINK,
        Ok(Signal::SIGUSR1) => BIT_STATUS,
        _ => return,
    };
    PENDING.fetch_or(bit, Ordering::SeqCst);
}

/// Translate a drained bitmask into commands, in escalation order.
fn commands_from_bits(bits: u32) -> Vec<Command> {
    let mut commands = Vec::new();
    if bits & BIT_STATUS != 0 {
        commands.push(Command::DumpStatus);
    }
    if bits & BIT_GROW != 0 {
        commands.push(Command::Grow);
    }
    if bits & BIT_SHRINK != 0 {
        commands.push(Command::Shrink);
    }
    if bits & BIT_RELOAD != 0 {
        commands.push(Command::Reload);
    }
    if bits & BIT_SHUTDOWN_GRACEFUL != 0 {
        commands.push(Command::Shutdown { graceful: true });
    }
    // An immediate shutdown overrides everything else pending
    if bits & BIT_SHUTDOWN_NOW != 0 {
        commands.push(Command::Shutdown { graceful: false });
    }
    commands
}

/// Install signal handlers and spawn the watcher thread.
///
/// The watcher polls the pending mask and forwards commands through the
/// control handle; it exits once the supervisor side of the channel is gone.
pub fn spawn_signal_watcher(handle: ControlHandle) -> JoinHandle<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGHUP,
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTTIN,
        Signal::SIGTTOU,
        Signal::SIGUSR1,
    ] {
        // Safety: the handler only touches an atomic
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            tracing::warn!(signal = %signal, error = %e, "Failed to install signal handler");
        }
    }

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            loop {
                let bits = PENDING.swap(0, Ordering::SeqCst);
                for command in commands_from_bits(bits) {
                    tracing::info!(?command, "Signal received");
                    if handle.send(command).is_err() {
                        return; // Supervisor is gone
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
        })
        .expect("Failed to spawn signal watcher thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivery_order() {
        let (handle, rx) = control_channel();
        handle.send(Command::Grow).unwrap();
        handle.send(Command::Reload).unwrap();
        assert_eq!(rx.recv().unwrap(), Command::Grow);
        assert_eq!(rx.recv().unwrap(), Command::Reload);
    }

    #[test]
    fn test_commands_from_bits_escalation() {
        let bits = BIT_RELOAD | BIT_SHUTDOWN_NOW | BIT_STATUS;
        let commands = commands_from_bits(bits);
        // Immediate shutdown comes last so it wins
        assert_eq!(
            commands.last(),
            Some(&Command::Shutdown { graceful: false })
        );
        assert!(commands.contains(&Command::Reload));
        assert!(commands.contains(&Command::DumpStatus));
    }

    #[test]
    fn test_empty_bits_no_commands() {
        assert!(commands_from_bits(0).is_empty());
    }

    #[test]
    fn test_handle_send_after_receiver_dropped() {
        let (handle, rx) = control_channel();
        drop(rx);
        assert!(handle.send(Command::Reload).is_err());
    }
}
