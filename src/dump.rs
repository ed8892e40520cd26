//! CLI presentation: renders the `Vec<StackTrace>` the engine returns either
//! as colored text (the default) or as JSON (`--json`), adapted from
//! py-spy's `dump.rs::print_traces`.

use anyhow::Error;
use console::style;

use crate::config::Config;
use crate::stack_trace::StackTrace;

pub fn print_traces(traces: &[StackTrace], config: &Config) -> Result<(), Error> {
    if config.dump_json {
        println!("{}", serde_json::to_string_pretty(traces)?);
        return Ok(());
    }

    for trace in traces.iter().rev() {
        let thread_id = trace.format_threadid();
        match trace.thread_name.as_ref() {
            Some(name) => {
                println!("Thread {} ({}): \"{}\"", style(thread_id).bold().yellow(), trace.status_str(), name);
            }
            None => {
                println!("Thread {} ({})", style(thread_id).bold().yellow(), trace.status_str());
            }
        };

        for frame in &trace.frames {
            let filename = match &frame.short_filename {
                Some(f) => f,
                None => &frame.filename,
            };
            let name = if frame.native { style(&frame.name).dim() } else { style(&frame.name).green() };
            if frame.line != 0 {
                println!("    {} ({}:{})", name, style(&filename).cyan(), style(frame.line).dim());
            } else {
                println!("    {} ({})", name, style(&filename).cyan());
            }

            if let Some(locals) = &frame.locals {
                let mut shown_args = false;
                let mut shown_locals = false;
                for local in locals {
                    if local.arg && !shown_args {
                        println!("        {}", style("Arguments:").dim());
                        shown_args = true;
                    } else if !local.arg && !shown_locals {
                        println!("        {}", style("Locals:").dim());
                        shown_locals = true;
                    }

                    let repr = local.repr.as_ref().map(String::as_str).unwrap_or("?");
                    println!("            {}: {}", local.name, repr);
                }
            }
        }
        println!();
    }
    Ok(())
}
