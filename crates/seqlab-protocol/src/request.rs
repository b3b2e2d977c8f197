//! Request model.
//!
//! The first frame of a connection is a flat, NUL-separated field
//! buffer. Field 0 is the header, `"<opcode> <username> <password>"`
//! (space-separated); the remaining fields depend on the opcode. The
//! buffer is parsed exactly once into an owned, validated [`Request`];
//! nothing downstream touches the raw bytes again.

use std::fmt;

use thiserror::Error;
use zeroize::Zeroizing;

/// Maximum total request payload, including terminators.
pub const MAX_REQUEST_LEN: usize = 8192;

/// Maximum length of the header field (field 0).
pub const MAX_HEADER_LEN: usize = 50;

/// Operations the broker can perform. One per process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Verify credentials and return the user's home directory.
    Authenticate = 1,
    /// Run a program, capture its output, relay it inline.
    RunInteractive = 2,
    /// Run a program, capture its output, leave a completion sentinel.
    RunBatch = 3,
    /// Create a directory.
    MakeDir = 4,
    /// Remove a file.
    DeleteFile = 5,
    /// Recursively remove a directory.
    DeleteDir = 6,
    /// Rename within the scoped directory.
    Rename = 7,
    /// Sorted listing of plain files.
    ListFiles = 8,
    /// Sorted listing of subdirectories.
    ListDirs = 9,
    /// Stream a file to the parent.
    GetFile = 10,
    /// Receive a file from the parent.
    PutFile = 11,
    /// Describe one sequence (length, weight, kind).
    DescribeSequence = 12,
    /// Describe a sequence set.
    DescribeSequenceSet = 13,
}

impl Opcode {
    /// Decode a numeric opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        use Opcode::*;
        Some(match value {
            1 => Authenticate,
            2 => RunInteractive,
            3 => RunBatch,
            4 => MakeDir,
            5 => DeleteFile,
            6 => DeleteDir,
            7 => Rename,
            8 => ListFiles,
            9 => ListDirs,
            10 => GetFile,
            11 => PutFile,
            12 => DescribeSequence,
            13 => DescribeSequenceSet,
            _ => return None,
        })
    }

    /// Number of fields required after the header.
    pub fn extra_fields(self) -> usize {
        use Opcode::*;
        match self {
            Authenticate => 0,
            // cmdline, environment block, working directory
            RunInteractive | RunBatch => 3,
            // old name, new name
            Rename => 2,
            MakeDir | DeleteFile | DeleteDir | ListFiles | ListDirs | GetFile | PutFile
            | DescribeSequence | DescribeSequenceSet => 1,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Authenticate => "authenticate",
            Opcode::RunInteractive => "run-interactive",
            Opcode::RunBatch => "run-batch",
            Opcode::MakeDir => "make-dir",
            Opcode::DeleteFile => "delete-file",
            Opcode::DeleteDir => "delete-dir",
            Opcode::Rename => "rename",
            Opcode::ListFiles => "list-files",
            Opcode::ListDirs => "list-dirs",
            Opcode::GetFile => "get-file",
            Opcode::PutFile => "put-file",
            Opcode::DescribeSequence => "describe-sequence",
            Opcode::DescribeSequenceSet => "describe-sequence-set",
        };
        f.write_str(name)
    }
}

/// A parsed, structurally validated request.
#[derive(Debug)]
pub struct Request {
    pub opcode: Opcode,
    pub username: String,
    /// Wiped when dropped; also wiped explicitly right after the
    /// credential comparison.
    pub password: Zeroizing<String>,
    /// Opcode-dependent fields, in wire order.
    pub args: Vec<String>,
}

/// Structural request rejection. All of these are raised before any
/// credential check runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request of {len} bytes exceeds buffer capacity of {MAX_REQUEST_LEN}")]
    Oversized { len: usize },

    #[error("request fills the buffer with no trailing terminator")]
    Unterminated,

    #[error("request is not valid UTF-8")]
    Encoding,

    #[error("header field exceeds {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,

    #[error("header must be '<opcode> <username> <password>'")]
    MalformedHeader,

    #[error("unknown opcode {0}")]
    UnknownOpcode(String),

    #[error("{opcode} requires {expected} field(s), got {got}")]
    FieldCount {
        opcode: Opcode,
        expected: usize,
        got: usize,
    },
}

impl Request {
    /// Parse a raw request payload.
    pub fn parse(payload: &[u8]) -> Result<Self, RequestError> {
        if payload.len() > MAX_REQUEST_LEN {
            return Err(RequestError::Oversized { len: payload.len() });
        }
        // A payload that exactly fills the buffer must still carry its
        // final terminator, otherwise the last field was cut short.
        if payload.len() == MAX_REQUEST_LEN && payload.last() != Some(&0) {
            return Err(RequestError::Unterminated);
        }

        let mut fields: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        // A trailing NUL produces one empty trailing piece; drop it.
        if fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }

        let header = fields.first().copied().unwrap_or_default();
        if header.len() > MAX_HEADER_LEN {
            return Err(RequestError::HeaderTooLong);
        }
        let header = std::str::from_utf8(header).map_err(|_| RequestError::Encoding)?;

        let mut words = header.split_ascii_whitespace();
        let (Some(op), Some(username), Some(password), None) =
            (words.next(), words.next(), words.next(), words.next())
        else {
            return Err(RequestError::MalformedHeader);
        };

        let opcode = op
            .parse::<u8>()
            .ok()
            .and_then(Opcode::from_u8)
            .ok_or_else(|| RequestError::UnknownOpcode(op.to_string()))?;

        let args = fields[1..]
            .iter()
            .map(|f| {
                std::str::from_utf8(f)
                    .map(str::to_owned)
                    .map_err(|_| RequestError::Encoding)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let expected = opcode.extra_fields();
        if args.len() != expected {
            return Err(RequestError::FieldCount {
                opcode,
                expected,
                got: args.len(),
            });
        }

        Ok(Request {
            opcode,
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            args,
        })
    }
}
