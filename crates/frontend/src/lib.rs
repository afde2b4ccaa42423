//! # soldb-frontend
//!
//! The line-oriented debugger REPL. All trace interpretation lives in
//! `soldb-backend`; this crate only reads commands, dispatches them to the
//! session, and prints the results.

#[macro_use]
extern crate tracing;

use std::io::{self, BufRead, Write};

use eyre::Result;
use soldb_backend::DebugSession;
use yansi::Paint;

pub struct Repl {
    session: DebugSession,
}

impl Repl {
    pub fn new(session: DebugSession) -> Self {
        Self { session }
    }

    /// Runs the command loop until the trace ends or stdin closes.
    ///
    /// Evaluation failures are printed and the loop continues; stepping
    /// failures (unresolvable contracts) abort.
    pub fn run(&mut self) -> Result<()> {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        while !self.session.is_ended() {
            self.print_context();
            print!("Command: ");
            io::stdout().flush()?;
            let Some(line) = lines.next() else { break };
            self.dispatch(line?.trim())?;
        }
        println!("The trace has ended.");
        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> Result<()> {
        debug!(command = line, "dispatching");
        match line {
            "" => {}
            "next" | "n" => self.session.next()?,
            "step" | "s" => self.session.step()?,
            "stepout" | "so" => self.session.stepout()?,
            "continue" | "c" => self.session.continu()?,
            "stack" | "st" => self.print_stack(),
            "memory" | "mem" => self.print_memory(),
            "breakpoints" => self.print_breakpoints(),
            "op" => {
                self.print_op();
                self.session.advance()?;
            }
            _ => {
                if let Some(spec) = line.strip_prefix("break ") {
                    self.add_breakpoint(spec.trim());
                } else if let Some(index) = line.strip_prefix("unbreak ") {
                    self.remove_breakpoint(index.trim());
                } else {
                    match self.session.evaluate(line) {
                        Ok(value) => println!("{value}"),
                        Err(err) => println!("{err}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// The surrounding source lines with the active fragment highlighted,
    /// headed by `address#path`.
    fn print_context(&self) {
        let Some(ctx) = self.session.source_context(3) else { return };
        println!("{}#{}", ctx.address, ctx.path);
        for (i, line) in ctx.lines.iter().enumerate() {
            let marker = if i == ctx.current { " => " } else { "    " };
            print!("{marker}:{} ", line.number);
            match line.highlight {
                Some((start, end)) => match split3(&line.text, start, end) {
                    Some((before, inside, after)) => {
                        println!("{before}{}{after}", inside.red())
                    }
                    None => println!("{}", line.text),
                },
                None => println!("{}", line.text),
            }
        }
    }

    fn print_stack(&self) {
        let Ok(step) = self.session.current_step() else { return };
        for word in step.stack.iter().rev() {
            println!("{word}");
        }
        println!();
    }

    fn print_memory(&self) {
        let Ok(step) = self.session.current_step() else { return };
        for (i, word) in step.memory.iter().enumerate() {
            println!("{:#x}: {word}", i * 32);
        }
        println!();
    }

    fn print_op(&self) {
        let Ok(step) = self.session.current_step() else { return };
        match &step.arg {
            Some(arg) => println!("{} {arg}", step.op),
            None => println!("{}", step.op),
        }
    }

    fn print_breakpoints(&self) {
        for (i, bp) in self.session.breakpoints().iter().enumerate() {
            println!("{i}: {bp}");
        }
    }

    fn add_breakpoint(&mut self, spec: &str) {
        let Some((path, line)) = parse_breakpoint(spec) else {
            println!("Breakpoint is invalid");
            return;
        };
        match self.session.add_breakpoint(&path, line) {
            Some(bp) => println!("Breakpoint set at {bp}"),
            None => println!("No loaded source file matches `{path}`"),
        }
    }

    fn remove_breakpoint(&mut self, index: &str) {
        let removed = index.parse().ok().and_then(|i| self.session.remove_breakpoint(i));
        match removed {
            Some(bp) => println!("Removed breakpoint {bp}"),
            None => println!("No such breakpoint"),
        }
    }
}

/// `path-substring:line` with a 1-based line number.
fn parse_breakpoint(spec: &str) -> Option<(String, usize)> {
    let (path, line) = spec.rsplit_once(':')?;
    let line: usize = line.parse().ok()?;
    if path.is_empty() || line == 0 {
        return None;
    }
    Some((path.to_string(), line))
}

/// Splits `text` around byte range `start..end`, or `None` when the range
/// does not fall on character boundaries.
fn split3(text: &str, start: usize, end: usize) -> Option<(&str, &str, &str)> {
    Some((text.get(..start)?, text.get(start..end)?, text.get(end..)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_specs() {
        assert_eq!(parse_breakpoint("Token.sol:12"), Some(("Token.sol".to_string(), 12)));
        assert_eq!(parse_breakpoint("dir/Token.sol:1"), Some(("dir/Token.sol".to_string(), 1)));
        assert_eq!(parse_breakpoint("Token.sol"), None);
        assert_eq!(parse_breakpoint("Token.sol:zero"), None);
        assert_eq!(parse_breakpoint("Token.sol:0"), None);
        assert_eq!(parse_breakpoint(":3"), None);
    }

    #[test]
    fn highlight_ranges_respect_char_boundaries() {
        assert_eq!(split3("abcdef", 1, 3), Some(("a", "bc", "def")));
        assert_eq!(split3("héllo", 1, 2), None);
        assert_eq!(split3("ab", 1, 5), None);
    }
}
