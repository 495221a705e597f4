use crate::{address, Cycle};
use std::io::BufRead;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected \"<cycle> <core> <op> <hex addr>\", got {text:?}")]
    Malformed { line: usize, text: String },

    #[error("line {line}: invalid number {value:?}")]
    Number {
        line: usize,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    #[error("line {line}: unknown operation {op:?}")]
    UnknownOp { line: usize, op: String },

    #[error("line {line}: cycle {cycle} is before the previous access")]
    OutOfOrder { line: usize, cycle: Cycle },

    #[error("access to core {core} but the hierarchy has {cores} core(s)")]
    UnknownCore { core: usize, cores: usize },
}

/// Kind of a trace access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum Op {
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "w")]
    Write,
    #[strum(serialize = "p")]
    Prefetch,
    #[strum(serialize = "ncr")]
    NonCacheableRead,
    #[strum(serialize = "ncw")]
    NonCacheableWrite,
}

/// One memory access issued by a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub cycle: Cycle,
    pub core: usize,
    pub op: Op,
    pub addr: address,
}

fn parse_line(line: usize, text: &str) -> Result<Option<Access>, Error> {
    let text = match text.split_once('#') {
        Some((before, _)) => before,
        None => text,
    };
    let fields: Vec<&str> = text.split_whitespace().collect();
    let [cycle, core, op, addr] = fields[..] else {
        if fields.is_empty() {
            return Ok(None);
        }
        return Err(Error::Malformed {
            line,
            text: text.trim().to_string(),
        });
    };
    let number = |value: &str, radix: u32| {
        u64::from_str_radix(value, radix).map_err(|source| Error::Number {
            line,
            value: value.to_string(),
            source,
        })
    };
    let op = op.parse::<Op>().map_err(|_| Error::UnknownOp {
        line,
        op: op.to_string(),
    })?;
    let addr = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .unwrap_or(addr);
    Ok(Some(Access {
        cycle: number(cycle, 10)?,
        core: number(core, 10)? as usize,
        op,
        addr: number(addr, 16)?,
    }))
}

/// Reads a trace, one access per line.
///
/// `#` starts a comment. Cycles must not decrease.
pub fn parse(reader: impl BufRead) -> Result<Vec<Access>, Error> {
    let mut accesses: Vec<Access> = Vec::new();
    for (idx, text) in reader.lines().enumerate() {
        let text = text?;
        let line = idx + 1;
        let Some(access) = parse_line(line, &text)? else {
            continue;
        };
        if let Some(last) = accesses.last() {
            if access.cycle < last.cycle {
                return Err(Error::OutOfOrder {
                    line,
                    cycle: access.cycle,
                });
            }
        }
        accesses.push(access);
    }
    Ok(accesses)
}

pub fn from_path(path: impl AsRef<Path>) -> Result<Vec<Access>, Error> {
    let file = std::fs::File::open(path)?;
    parse(std::io::BufReader::new(file))
}
