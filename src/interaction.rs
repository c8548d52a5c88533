//! User interaction callbacks.
//!
//! Everything the engine may need to tell or ask the operator goes through
//! this trait: progress and warning messages, yes/no confirmations, media
//! swap pauses, passphrase prompts. Implementations must be callable from
//! any context the engine runs in.

use libc::ECHO;
use libc::ECHOE;
use libc::ICANON;
use libc::STDIN_FILENO;
use libc::TCSANOW;
use libc::VMIN;
use libc::tcgetattr;
use libc::tcsetattr;
use libc::termios;
use std::io::BufRead;
use std::io::Write;
use std::mem::MaybeUninit;
use std::{fmt, io};

use crate::error::{Error, Result};
use crate::secure::SecuString;

/// The four callbacks the engine relies on.
pub trait UserInteraction {
    /// Reports a message to the user.
    fn message(&mut self, text: &str);

    /// Asks a yes/no question. Returning false means "no".
    fn pause(&mut self, text: &str) -> bool;

    /// Prompts for a regular string.
    fn get_string(&mut self, prompt: &str, echo: bool) -> Result<String>;

    /// Prompts for a secret; the returned storage is wiped on drop.
    fn get_secu_string(&mut self, prompt: &str, echo: bool) -> Result<SecuString>;

    /// [`UserInteraction::pause`] raised to an error when the user declines.
    fn pause_or_abort(&mut self, text: &str) -> Result<()> {
        if self.pause(text) {
            Ok(())
        } else {
            Err(Error::UserAbort(text.to_owned()))
        }
    }
}

/// Terminal implementation over stdin/stderr.
#[derive(Debug, Default)]
pub struct StdioInteraction;

/// Show a prompt and read one line. When `hidden`, terminal echo is turned
/// off for the duration of the input.
fn prompt_line<P: fmt::Display>(prompt: P, hidden: bool) -> io::Result<String> {
    // Save termios state
    let saved_termios = unsafe {
        let mut t: termios = MaybeUninit::zeroed().assume_init();
        tcgetattr(STDIN_FILENO, &mut t);
        t
    };
    if hidden {
        let mut termios = saved_termios;
        termios.c_lflag &= !(ICANON | ECHO | ECHOE);
        termios.c_cc[VMIN] = 1;
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &termios);
        }
    }
    eprint!("{prompt}");
    let _ = io::stderr().flush();
    let input = io::stdin()
        .lock()
        .lines()
        .next()
        .unwrap_or(Ok(String::new()));
    if hidden {
        eprintln!();
        // Restore termios state
        unsafe {
            tcsetattr(STDIN_FILENO, TCSANOW, &saved_termios);
        }
    }
    input
}

impl UserInteraction for StdioInteraction {
    fn message(&mut self, text: &str) {
        eprintln!("{text}");
    }

    fn pause(&mut self, text: &str) -> bool {
        match prompt_line(format_args!("{text} [y/N] "), false) {
            Ok(answer) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }

    fn get_string(&mut self, prompt: &str, echo: bool) -> Result<String> {
        prompt_line(prompt, !echo).map_err(|e| Error::system("reading answer", e))
    }

    fn get_secu_string(&mut self, prompt: &str, echo: bool) -> Result<SecuString> {
        let mut line = prompt_line(prompt, !echo).map_err(|e| Error::system("reading answer", e))?;
        let secret = SecuString::from_str(&line);
        // best effort wipe of the transient line
        unsafe {
            for b in line.as_bytes_mut() {
                std::ptr::write_volatile(b, 0);
            }
        }
        Ok(secret)
    }
}

/// Implementation that answers every question with a constant, for
/// unattended runs and tests.
#[derive(Debug)]
pub struct SilentInteraction {
    /// Answer given to every [`UserInteraction::pause`] call.
    pub accept: bool,
    /// Messages accumulated instead of being printed.
    pub transcript: Vec<String>,
}

impl SilentInteraction {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            transcript: Vec::new(),
        }
    }
}

impl UserInteraction for SilentInteraction {
    fn message(&mut self, text: &str) {
        self.transcript.push(text.to_owned());
    }

    fn pause(&mut self, text: &str) -> bool {
        self.transcript.push(text.to_owned());
        self.accept
    }

    fn get_string(&mut self, _prompt: &str, _echo: bool) -> Result<String> {
        Err(Error::Libcall(
            "no terminal available to prompt the user".into(),
        ))
    }

    fn get_secu_string(&mut self, _prompt: &str, _echo: bool) -> Result<SecuString> {
        Err(Error::Libcall(
            "no terminal available to prompt the user".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_interaction_records_and_answers() {
        let mut ui = SilentInteraction::new(true);
        ui.message("saving");
        assert!(ui.pause("continue?"));
        assert!(ui.pause_or_abort("again?").is_ok());
        assert_eq!(ui.transcript.len(), 3);

        let mut ui = SilentInteraction::new(false);
        assert!(matches!(
            ui.pause_or_abort("sure?"),
            Err(Error::UserAbort(_))
        ));
    }
}
