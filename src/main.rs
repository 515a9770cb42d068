mod chunk;
mod compiler;
mod error;
mod gc;
mod objects;
mod scanner;
mod vm;

use std::env;
use std::fs;
use std::io::{self, Write};
use std::process;

use crate::error::LoxError;
use crate::vm::Vm;

fn repl() {
    let mut vm = Vm::new();
    loop {
        print!("> ");
        io::stdout().flush().expect("Unable to flush stdout");
        let mut line = String::new();
        io::stdin()
            .read_line(&mut line)
            .expect("Unable to read line from the REPL");
        if line.is_empty() {
            break;
        }
        // Errors already printed their diagnostics; keep prompting.
        let _ = vm.interpret(&line);
    }
}

fn run_file(path: &str) {
    let code = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            eprintln!("Unable to read file {}: {}", path, error);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&code) {
        Ok(()) => (),
        Err(LoxError::CompileError(_)) => process::exit(65),
        Err(LoxError::RuntimeError) => process::exit(70),
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: bytelox [path]");
            process::exit(64);
        }
    }
}
