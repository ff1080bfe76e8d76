use std::fs;
use std::io::ErrorKind;

use thiserror::Error;

use crate::instructions::instructions::{get_opcode, Instr, Program};

#[derive(Error, Debug)]
pub(crate) enum LoadError {
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    IOError(String),
    #[error("{}", .0.join("\n"))]
    AnalysisError(Vec<String>),
}

struct Loader {
    code: Vec<Instr>,
    errors: Vec<String>,
}

impl Loader {
    fn load(&mut self, input: &str) {
        for (index, line) in input.lines().enumerate() {
            self.parse_line(index + 1, line);
        }
    }

    fn parse_line(&mut self, line_nr: usize, line: &str) {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return;
        }

        let mut tokens = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty());

        let mnemonic = match tokens.next() {
            Some(mnemonic) => mnemonic,
            None => return,
        };

        let opcode = match get_opcode(mnemonic) {
            Some(opcode) => opcode,
            None => {
                self.errors.push(format!("Unknown mnemonic '{}' at line {}", mnemonic, line_nr));
                return;
            }
        };

        let operands = tokens.map(String::from).collect();
        self.code.push(Instr::new(opcode, operands, line_nr));
    }
}

fn strip_comment(line: &str) -> &str {
    let end = [line.find(';'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..end]
}

pub(crate) fn load_from_string(src: String) -> Result<Program, LoadError> {
    let mut loader = Loader { code: Vec::new(), errors: Vec::new() };

    loader.load(&src);

    if !loader.errors.is_empty() {
        return Err(LoadError::AnalysisError(loader.errors));
    }

    Ok(Program::new(loader.code))
}

pub(crate) fn load(path: &str) -> Result<Program, LoadError> {
    let input = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(LoadError::NotFoundError(format!("File '{}' not found.", path)));
        }
        Err(err) => {
            return Err(LoadError::IOError(format!("Error reading file '{}': {}", path, err)));
        }
    };

    load_from_string(input)
}
