//! # Command Dispatch
//!
//! A single typed entry point over the session operations, mirroring a
//! syscall-style interface: every command carries its arguments, a static
//! [`CommandSpec`] describes its shape, and [`Monitor::dispatch`] checks
//! the shape before any operation logic runs. Callers that want plain
//! method calls can use the [`Monitor`] methods directly; this layer
//! exists for embedders that funnel requests through one choke point.

use perfmon_hal::CpuId;

use crate::context::CtxState;
use crate::error::{PmuError, Result};
use crate::monitor::{Monitor, SessionId};
use crate::regset::RegSet;
use crate::session::{CreateRequest, CreateResponse, PmcArg, PmdArg};
use crate::task::TaskHandle;

/// How many arguments a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCount {
    Zero,
    /// A batch of at least one register argument.
    OneOrMore,
}

/// Static shape of one command.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub args: ArgCount,
    /// Size in bytes of one argument element.
    pub arg_size: usize,
    /// The command operates on an existing session.
    pub needs_session: bool,
    /// The command is refused while the session is actively counting.
    pub stopped_only: bool,
}

/// One request against the monitoring API.
#[derive(Debug)]
pub enum Command {
    Create(CreateRequest),
    Enable { cpu: CpuId },
    Start { cpu: CpuId },
    Stop,
    Disable,
    WritePmcs(Vec<PmcArg>),
    WritePmds(Vec<PmdArg>),
    ReadPmds { cpu: CpuId, args: Vec<PmdArg> },
    Restart,
    Destroy,
    Protect,
    Unprotect,
    UseWatchpoints(RegSet),
    DropWatchpoints,
}

/// What a dispatched command hands back.
#[derive(Debug)]
pub enum CommandOutput {
    None,
    Created(CreateResponse),
    /// The batch with values and per-argument flags filled in.
    Pmds(Vec<PmdArg>),
}

impl Command {
    pub fn spec(&self) -> &'static CommandSpec {
        use core::mem::size_of;

        macro_rules! spec {
            ($name:literal, $args:expr, $size:expr, $session:literal, $stopped:literal) => {{
                static SPEC: CommandSpec = CommandSpec {
                    name: $name,
                    args: $args,
                    arg_size: $size,
                    needs_session: $session,
                    stopped_only: $stopped,
                };
                &SPEC
            }};
        }
        match self {
            Command::Create(_) => {
                spec!("create", ArgCount::Zero, size_of::<CreateRequest>(), false, false)
            }
            Command::Enable { .. } => spec!("enable", ArgCount::Zero, 0, true, false),
            Command::Start { .. } => spec!("start", ArgCount::Zero, 0, true, false),
            Command::Stop => spec!("stop", ArgCount::Zero, 0, true, false),
            Command::Disable => spec!("disable", ArgCount::Zero, 0, true, false),
            Command::WritePmcs(_) => {
                spec!("write_pmcs", ArgCount::OneOrMore, size_of::<PmcArg>(), true, true)
            }
            Command::WritePmds(_) => {
                spec!("write_pmds", ArgCount::OneOrMore, size_of::<PmdArg>(), true, true)
            }
            Command::ReadPmds { .. } => {
                spec!("read_pmds", ArgCount::OneOrMore, size_of::<PmdArg>(), true, false)
            }
            Command::Restart => spec!("restart", ArgCount::Zero, 0, true, false),
            Command::Destroy => spec!("destroy", ArgCount::Zero, 0, true, false),
            Command::Protect => spec!("protect", ArgCount::Zero, 0, true, false),
            Command::Unprotect => spec!("unprotect", ArgCount::Zero, 0, true, false),
            Command::UseWatchpoints(_) => {
                spec!("use_watchpoints", ArgCount::Zero, size_of::<RegSet>(), true, false)
            }
            Command::DropWatchpoints => spec!("drop_watchpoints", ArgCount::Zero, 0, true, false),
        }
    }

    fn batch_len(&self) -> Option<usize> {
        match self {
            Command::WritePmcs(args) => Some(args.len()),
            Command::WritePmds(args) | Command::ReadPmds { args, .. } => Some(args.len()),
            _ => None,
        }
    }
}

impl Monitor {
    /// Validate a command's shape against its [`CommandSpec`] and run it.
    pub fn dispatch(
        &self,
        caller: TaskHandle,
        session: Option<SessionId>,
        cmd: Command,
    ) -> Result<CommandOutput> {
        let spec = cmd.spec();
        log::trace!("dispatch {} by pid {}", spec.name, caller.pid());

        if spec.needs_session && session.is_none() {
            return Err(PmuError::InvalidArgument);
        }
        if spec.args == ArgCount::OneOrMore && cmd.batch_len() == Some(0) {
            return Err(PmuError::InvalidArgument);
        }
        if spec.stopped_only {
            if let Some(sid) = session {
                if self.session_state(sid)? == CtxState::Active {
                    return Err(PmuError::Busy);
                }
            }
        }

        let sid = session.unwrap_or_else(|| {
            // Only Create reaches this; the placeholder is never used.
            debug_assert!(!spec.needs_session);
            SessionId::invalid()
        });

        match cmd {
            Command::Create(req) => Ok(CommandOutput::Created(self.create_session(caller, &req)?)),
            Command::Enable { cpu } => self.enable(caller, cpu, sid).map(|_| CommandOutput::None),
            Command::Start { cpu } => self.start(caller, cpu, sid).map(|_| CommandOutput::None),
            Command::Stop => self.stop(caller, sid).map(|_| CommandOutput::None),
            Command::Disable => self.disable(caller, sid).map(|_| CommandOutput::None),
            Command::WritePmcs(mut args) => {
                self.write_pmcs(caller, sid, &mut args)?;
                Ok(CommandOutput::None)
            }
            Command::WritePmds(mut args) => {
                self.write_pmds(caller, sid, &mut args)?;
                Ok(CommandOutput::None)
            }
            Command::ReadPmds { cpu, mut args } => {
                self.read_pmds(caller, cpu, sid, &mut args)?;
                Ok(CommandOutput::Pmds(args))
            }
            Command::Restart => self.restart(caller, sid).map(|_| CommandOutput::None),
            Command::Destroy => self.destroy(caller, sid).map(|_| CommandOutput::None),
            Command::Protect => self.protect(caller, sid).map(|_| CommandOutput::None),
            Command::Unprotect => self.unprotect(caller, sid).map(|_| CommandOutput::None),
            Command::UseWatchpoints(regs) => self
                .use_watchpoints(caller, sid, regs)
                .map(|_| CommandOutput::None),
            Command::DropWatchpoints => self
                .drop_watchpoints(caller, sid)
                .map(|_| CommandOutput::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;
    use perfmon_hal::{SimPmu, Tunables};
    use std::sync::Arc;

    fn monitor() -> Monitor {
        Monitor::new(Arc::new(SimPmu::new(1)), Arc::new(Tunables::new()))
    }

    #[test]
    fn session_commands_need_a_session() {
        let mon = monitor();
        let task = mon.register_task();
        assert_eq!(
            mon.dispatch(task, None, Command::Stop).err(),
            Some(PmuError::InvalidArgument)
        );
    }

    #[test]
    fn empty_batches_are_rejected() {
        let mon = monitor();
        let task = mon.register_task();
        let resp = mon
            .create_session(task, &CreateRequest::default())
            .unwrap();
        assert_eq!(
            mon.dispatch(task, Some(resp.session), Command::WritePmcs(Vec::new()))
                .err(),
            Some(PmuError::InvalidArgument)
        );
    }

    #[test]
    fn dispatch_reaches_the_operations() {
        let mon = monitor();
        let task = mon.register_task();
        let out = mon
            .dispatch(task, None, Command::Create(CreateRequest::default()))
            .unwrap();
        let CommandOutput::Created(resp) = out else {
            panic!("expected a created session");
        };
        mon.dispatch(task, Some(resp.session), Command::Enable { cpu: 0 })
            .unwrap();
        mon.dispatch(task, Some(resp.session), Command::Destroy)
            .unwrap();
    }
}
