// Interactive REPL over the interpreter, with line editing.

use emberlisp::{Interp, StdPlatform};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("emberlisp v0.1.0");
    println!("Type (exit) or Ctrl+D to quit");
    println!();

    let mut interp = Interp::new(Box::new(StdPlatform));
    let mut rl = DefaultEditor::new()?;

    let _ = rl.load_history("emberlisp_history.txt");

    loop {
        let readline = rl.readline("lisp> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "(exit)" || line == "exit" {
                    break;
                }
                rl.add_history_entry(line)?;

                let mut had_error = false;
                let result = interp.dostring(line, &mut |interp, err| {
                    eprintln!("{}", interp.format(err));
                    had_error = true;
                });
                if !had_error {
                    println!("{}", interp.format(result));
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }

    let _ = rl.save_history("emberlisp_history.txt");

    Ok(())
}
