use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::InterpreterConfig;
use crate::execution::ExecutionRequest;
use crate::interpreter::CodeInterpreter;

const END_COMMAND: &str = "END";
const RESET_COMMAND: &str = "RESET";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Chunk {
    code: String,
    reset: bool,
}

/// Groups stdin lines into code chunks terminated by `END` (or EOF).
#[derive(Debug, Default)]
struct ChunkAssembler {
    buffer: String,
    reset_next: bool,
}

impl ChunkAssembler {
    fn push_line(&mut self, line: &str) -> Option<Chunk> {
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed == END_COMMAND {
            return Some(self.take());
        }
        if trimmed == RESET_COMMAND && self.buffer.is_empty() {
            self.reset_next = true;
            return None;
        }
        self.buffer.push_str(trimmed);
        self.buffer.push('\n');
        None
    }

    fn finish(&mut self) -> Option<Chunk> {
        if self.buffer.trim().is_empty() && !self.reset_next {
            return None;
        }
        Some(self.take())
    }

    fn take(&mut self) -> Chunk {
        Chunk {
            code: std::mem::take(&mut self.buffer),
            reset: std::mem::take(&mut self.reset_next),
        }
    }
}

pub(crate) async fn run(config: InterpreterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let timeout_label = config
        .default_timeout_secs
        .map(|secs| format!("{secs}s"))
        .unwrap_or_else(|| "off".to_string());
    eprintln!(
        "debug repl: timeout={timeout_label} | end input with {END_COMMAND} | {RESET_COMMAND} resets the next chunk | Ctrl-D to exit"
    );

    let interpreter = CodeInterpreter::new(config);
    let owner_id = format!("debug-repl_{}", std::process::id());
    let timeout_secs = interpreter.config().default_timeout_secs;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut assembler = ChunkAssembler::default();

    loop {
        let chunk = match lines.next_line().await? {
            Some(line) => match assembler.push_line(&line) {
                Some(chunk) => chunk,
                None => continue,
            },
            None => match assembler.finish() {
                Some(chunk) => chunk,
                None => break,
            },
        };

        let request = ExecutionRequest::new(chunk.code)
            .with_timeout(timeout_secs)
            .with_reset(chunk.reset);
        let blank = request.is_blank();
        match interpreter.run(&owner_id, request).await {
            Ok(result) => {
                let text = result.render();
                let mut stdout = std::io::stdout();
                if text.is_empty() && !blank {
                    writeln!(stdout, "Finished execution.")?;
                } else {
                    writeln!(stdout, "{text}")?;
                }
                stdout.flush()?;
            }
            Err(err) => eprintln!("code interpreter error: {err}"),
        }
    }

    interpreter.shutdown().await;
    Ok(())
}
