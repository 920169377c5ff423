//! step CLI - interpreter for pattern-matched text generation.
//!
//! Usage:
//! - `step` - start the interactive REPL
//! - `step <file.step>...` - load files, then start the REPL
//! - `step --help` - show help

use std::io::{self, BufRead, Write};
use steplang::repl::Repl;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h" || a == "help") {
        print_help();
        return;
    }

    steplang::trace::init_subscriber();

    let mut repl = Repl::new();
    for path in &args {
        match repl.process_input(&format!("load {}", path)) {
            Ok(Some(msg)) => println!("{}", msg),
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    run_repl(&mut repl);
}

fn print_help() {
    println!("step - pattern-matched text generation\n");
    println!("Usage:");
    println!("  step                   Start interactive REPL");
    println!("  step <file.step>...    Load definitions, then start the REPL");
    println!("\nType 'help' inside the REPL for commands.");
}

fn run_repl(repl: &mut Repl) {
    println!("step - pattern-matched text generation");
    println!("Type 'help' for usage, 'quit' to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                // EOF
                println!("\nGoodbye!");
                break;
            }
            Ok(_) => match repl.process_input(&line) {
                Ok(Some(output)) => println!("{}", output),
                Ok(None) => {}
                Err(signal) if signal == "quit" => {
                    println!("Goodbye!");
                    break;
                }
                Err(message) => eprintln!("Error: {}", message),
            },
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }
}
