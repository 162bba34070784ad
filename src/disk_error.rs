// Disk drive status codes and error types

use std::{fmt, io};

/// Status byte a storage device reports through `DEVSTU` and the peer status register.
/// Codes below 128 mean success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceStatusCode {
    Ready = 0,
    OperationFailed = 1,
    IllegalCommand = 128,
    NoSuchFileExists = 129,
    FileAlreadyOpened = 130,
    OperationNotPermitted = 131,
    ReadOnly = 132,
    NotAFile = 133,
    NotADirectory = 134,
    NoFileOpened = 135,
    SystemIoError = 192,
    SystemSecurityError = 193,
}

impl DeviceStatusCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        use DeviceStatusCode::*;
        let status = match code {
            0 => Ready,
            1 => OperationFailed,
            128 => IllegalCommand,
            129 => NoSuchFileExists,
            130 => FileAlreadyOpened,
            131 => OperationNotPermitted,
            132 => ReadOnly,
            133 => NotAFile,
            134 => NotADirectory,
            135 => NoFileOpened,
            192 => SystemIoError,
            193 => SystemSecurityError,
            _ => return None,
        };
        Some(status)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_error(self) -> bool {
        self.code() >= 128
    }

    pub fn message(self) -> &'static str {
        match self {
            DeviceStatusCode::Ready => "READY",
            DeviceStatusCode::OperationFailed => "OPERATION FAILED",
            DeviceStatusCode::IllegalCommand => "SYNTAX ERROR",
            DeviceStatusCode::NoSuchFileExists => "NO SUCH FILE EXISTS",
            DeviceStatusCode::FileAlreadyOpened => "FILE ALREADY OPENED",
            DeviceStatusCode::OperationNotPermitted => "OPERATION NOT PERMITTED",
            DeviceStatusCode::ReadOnly => "READ ONLY",
            DeviceStatusCode::NotAFile => "NOT A FILE",
            DeviceStatusCode::NotADirectory => "NOT A DIRECTORY",
            DeviceStatusCode::NoFileOpened => "NO FILE OPENED",
            DeviceStatusCode::SystemIoError => "IO ERROR ON SIMULATED DRIVE",
            DeviceStatusCode::SystemSecurityError => "SECURITY ERROR ON SIMULATED DRIVE",
        }
    }
}

impl fmt::Display for DeviceStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[derive(Debug)]
pub enum DiskError {
    IllegalCommand(String),
    NoSuchFile(String),
    FileAlreadyOpened,
    OperationNotPermitted,
    NotAFile,
    NotADirectory,
    NoFileOpened,
    OperationFailed,
    Io(io::Error),
    Security(io::Error),
}

impl DiskError {
    pub fn status_code(&self) -> DeviceStatusCode {
        match self {
            DiskError::IllegalCommand(_) => DeviceStatusCode::IllegalCommand,
            DiskError::NoSuchFile(_) => DeviceStatusCode::NoSuchFileExists,
            DiskError::FileAlreadyOpened => DeviceStatusCode::FileAlreadyOpened,
            DiskError::OperationNotPermitted => DeviceStatusCode::OperationNotPermitted,
            DiskError::NotAFile => DeviceStatusCode::NotAFile,
            DiskError::NotADirectory => DeviceStatusCode::NotADirectory,
            DiskError::NoFileOpened => DeviceStatusCode::NoFileOpened,
            DiskError::OperationFailed => DeviceStatusCode::OperationFailed,
            DiskError::Io(_) => DeviceStatusCode::SystemIoError,
            DiskError::Security(_) => DeviceStatusCode::SystemSecurityError,
        }
    }
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::IllegalCommand(cmd) => write!(f, "Illegal command: {:?}", cmd),
            DiskError::NoSuchFile(path) => write!(f, "No such file: {}", path),
            DiskError::FileAlreadyOpened => write!(f, "A file is already open"),
            DiskError::OperationNotPermitted => write!(f, "Operation not permitted"),
            DiskError::NotAFile => write!(f, "Not a file"),
            DiskError::NotADirectory => write!(f, "Not a directory"),
            DiskError::NoFileOpened => write!(f, "No file opened"),
            DiskError::OperationFailed => write!(f, "Operation failed"),
            DiskError::Io(err) => write!(f, "I/O error: {}", err),
            DiskError::Security(err) => write!(f, "Access denied: {}", err),
        }
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Io(err) | DiskError::Security(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => DiskError::Security(err),
            _ => DiskError::Io(err),
        }
    }
}
