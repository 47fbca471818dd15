//! Command monitoring events and hook registration.
use crate::error::Error as MongoError;
use crate::error::Result;
use crate::Client;

use bson::Document;

use std::fmt::{Display, Error, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// A command that has been sent to the server.
pub struct CommandStarted {
    pub command: Document,
    pub database_name: String,
    pub command_name: String,
    pub request_id: i64,
    pub connection_string: String,
}

impl Display for CommandStarted {
    fn fmt(&self, fmt: &mut Formatter) -> std::result::Result<(), Error> {
        fmt.write_fmt(format_args!(
            "COMMAND.{} {} STARTED: {:?}",
            self.command_name, self.connection_string, self.command
        ))
    }
}

/// The outcome of a command round-trip, reported to completion hooks.
pub enum CommandResult<'a> {
    Success {
        duration: u64,
        reply: Document,
        command_name: String,
        request_id: i64,
        connection_string: String,
    },
    Failure {
        duration: u64,
        command_name: String,
        failure: &'a MongoError,
        request_id: i64,
        connection_string: String,
    },
}

impl<'a> Display for CommandResult<'a> {
    fn fmt(&self, fmt: &mut Formatter) -> std::result::Result<(), Error> {
        match *self {
            CommandResult::Success {
                duration,
                ref reply,
                ref command_name,
                request_id: _,
                ref connection_string,
            } => fmt.write_fmt(format_args!(
                "COMMAND.{} {} COMPLETED: {:?} ({} ns)",
                command_name, connection_string, reply, duration
            )),
            CommandResult::Failure {
                duration,
                ref command_name,
                ref failure,
                request_id: _,
                ref connection_string,
            } => fmt.write_fmt(format_args!(
                "COMMAND.{} {} FAILURE: {} ({} ns)",
                command_name, connection_string, failure, duration
            )),
        }
    }
}

pub type StartHook = fn(Client, &CommandStarted);
pub type CompletionHook = fn(Client, &CommandResult);

/// Holds the registered command-monitoring hooks for a client.
pub struct Listener {
    no_start_hooks: AtomicBool,
    no_completion_hooks: AtomicBool,
    start_hooks: RwLock<Vec<StartHook>>,
    completion_hooks: RwLock<Vec<CompletionHook>>,
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_start_hooks: AtomicBool::new(true),
            no_completion_hooks: AtomicBool::new(true),
            start_hooks: RwLock::new(Vec::new()),
            completion_hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_start_hook(&self, hook: StartHook) -> Result<()> {
        let mut guard = self.start_hooks.write()?;
        self.no_start_hooks.store(false, Ordering::SeqCst);
        Ok(guard.deref_mut().push(hook))
    }

    pub fn add_completion_hook(&self, hook: CompletionHook) -> Result<()> {
        let mut guard = self.completion_hooks.write()?;
        self.no_completion_hooks.store(false, Ordering::SeqCst);
        Ok(guard.deref_mut().push(hook))
    }

    pub fn run_start_hooks(&self, client: Client, started: &CommandStarted) -> Result<()> {
        if self.no_start_hooks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.start_hooks.read()?;

        for hook in guard.deref().iter() {
            hook(client.clone(), started);
        }

        Ok(())
    }

    pub fn run_completion_hooks(&self, client: Client, result: &CommandResult) -> Result<()> {
        if self.no_completion_hooks.load(Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.completion_hooks.read()?;

        for hook in guard.deref().iter() {
            hook(client.clone(), result);
        }

        Ok(())
    }
}
