// Virtual disk drive
// A storage device that plugs into a block-transfer port and serves a host directory

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use derivative::Derivative;

use crate::{
    block_transfer::{
        compose_negative_answer, compose_positive_answer, latin1_to_string, string_to_latin1,
        trim_null, BlockTransferInterface, PeerLink, TransferState, BLOCK_SIZE,
        END_OF_SEND_BLOCK,
    },
    disk_error::{DeviceStatusCode, DiskError},
};

pub const DEFAULT_DRIVE_NAME: &str = "Virtual Disk Drive";
pub const BOOT_SECTOR_FILE: &str = "!BOOTSEC";

const LISTING_COLUMN: usize = 40;
const DIRECTORY_TAG: u8 = 0x11;
const FILE_TAG: u8 = 0x12;
const RECORD_SEP: u8 = 0x1E;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: PathBuf,
    pub mode: OpenMode,
}

#[derive(Debug)]
struct PendingWrite {
    len: usize,
    buffer: Vec<u8>,
}

type CommandResult = Result<Option<Vec<u8>>, DiskError>;

/// Storage device rooted at a host directory.
///
/// Commands arrive through [`BlockTransferInterface::writeout`]. Identity and status queries are
/// answered inline; `READ`, `LIST`, `LISTFILES` and `GETLEN` stage their output in the compose
/// buffer, which the host then drains one block per read.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VirtualDiskDrive {
    state: TransferState,
    root: PathBuf,
    name: String,
    drive_num: usize,
    open: Option<OpenFile>,
    #[derivative(Debug = "ignore")]
    compose: Vec<u8>,
    #[derivative(Debug = "ignore")]
    send_buffer: Vec<u8>,
    blocks_sent: usize,
    #[derivative(Debug = "ignore")]
    pending_write: Option<PendingWrite>,
}

impl VirtualDiskDrive {
    /// Creates the drive, creating `root` if it does not exist yet.
    pub fn new(root: impl Into<PathBuf>, drive_num: usize) -> Result<Self, DiskError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::info!("[DISK {}] Mounted {:?}", drive_num, root);

        Ok(Self {
            state: TransferState::new(false, true),
            root,
            name: DEFAULT_DRIVE_NAME.to_string(),
            drive_num,
            open: None,
            compose: Vec::new(),
            send_buffer: Vec::new(),
            blocks_sent: 0,
            pending_write: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn into_link(self) -> PeerLink {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open_file(&self) -> Option<&OpenFile> {
        self.open.as_ref()
    }

    pub fn status(&self) -> Option<DeviceStatusCode> {
        DeviceStatusCode::from_u8(self.state.status_code)
    }

    fn set_status(&mut self, status: DeviceStatusCode) {
        self.state.status_code = status.code();
    }

    pub fn reset(&mut self) {
        self.open = None;
        self.pending_write = None;
        self.compose.clear();
        self.send_buffer.clear();
        self.blocks_sent = 0;
        self.set_status(DeviceStatusCode::Ready);
    }

    fn status_frame(&self) -> Vec<u8> {
        let code = self.state.status_code;
        let message = DeviceStatusCode::from_u8(code)
            .map(DeviceStatusCode::message)
            .unwrap_or("");
        if code < 128 {
            compose_positive_answer(&[&[code], message.as_bytes()])
        } else {
            compose_negative_answer(&[&[code], message.as_bytes()])
        }
    }

    fn stage(&mut self, data: Vec<u8>) {
        self.compose = data;
        self.send_buffer.clear();
        self.blocks_sent = 0;
    }

    fn remaining(&self) -> usize {
        if self.blocks_sent == 0 {
            self.compose.len()
        } else {
            self.send_buffer
                .len()
                .saturating_sub(self.blocks_sent * BLOCK_SIZE)
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(clamp_to_root(&sanitise_path(path)))
    }

    fn opened(&self) -> Result<&OpenFile, DiskError> {
        self.open.as_ref().ok_or(DiskError::NoFileOpened)
    }

    fn opened_for_writing(&self) -> Result<&OpenFile, DiskError> {
        let file = self.opened()?;
        match file.mode {
            OpenMode::Read => Err(DiskError::OperationNotPermitted),
            OpenMode::Write | OpenMode::Append => Ok(file),
        }
    }

    fn execute(&mut self, command: &str) -> CommandResult {
        if command.starts_with("DEVRST\x17") {
            tracing::debug!("[DISK {}] Device reset", self.drive_num);
            self.reset();
            Ok(None)
        } else if let Some(args) = command.strip_prefix("OPEN") {
            self.open(args)
        } else if command.starts_with("LISTFILES") {
            self.list_files()
        } else if command.starts_with("LIST") {
            self.list()
        } else if command.starts_with("GETLEN") {
            self.get_len()
        } else if command.starts_with("READ") {
            self.read()
        } else if command.starts_with("DELETE") {
            self.delete()
        } else if command.starts_with("MKDIR") {
            self.mkdir()
        } else if command.starts_with("MKFILE") {
            self.mkfile()
        } else if command.starts_with("TOUCH") {
            self.touch()
        } else if let Some(args) = command.strip_prefix("WRITE") {
            self.start_write(args)
        } else if command.starts_with("LOADBOOT") {
            self.load_boot()
        } else if command.starts_with("CLOSE") {
            self.open = None;
            self.pending_write = None;
            Ok(None)
        } else {
            Err(DiskError::IllegalCommand(command.to_string()))
        }
    }

    fn open(&mut self, args: &str) -> CommandResult {
        if self.open.is_some() {
            return Err(DiskError::FileAlreadyOpened);
        }

        let illegal = || DiskError::IllegalCommand(format!("OPEN{}", args));
        let args = strip_terminator(args);
        let mut chars = args.chars();
        let mode = match chars.next() {
            Some('R') => OpenMode::Read,
            Some('W') => OpenMode::Write,
            Some('A') => OpenMode::Append,
            _ => return Err(illegal()),
        };

        let quoted = chars.as_str().strip_prefix('"').ok_or_else(illegal)?;
        let close = quoted.rfind('"').ok_or_else(illegal)?;
        let path_str = &quoted[..close];
        let tail = &quoted[close + 1..];
        let drive = if tail.is_empty() {
            None
        } else {
            let number = tail
                .strip_prefix(',')
                .and_then(|n| n.trim().parse::<usize>().ok())
                .ok_or_else(illegal)?;
            Some(number)
        };

        let path = self.resolve(path_str);
        tracing::debug!(
            "[DISK {}] OPEN {:?} {:?} (drive {:?})",
            self.drive_num,
            mode,
            path,
            drive
        );

        if mode == OpenMode::Read && !path.exists() {
            return Err(DiskError::NoSuchFile(path_str.to_string()));
        }

        self.open = Some(OpenFile { path, mode });
        self.blocks_sent = 0;
        Ok(None)
    }

    fn read(&mut self) -> CommandResult {
        let file = self.opened()?;
        if file.mode != OpenMode::Read {
            return Err(DiskError::OperationNotPermitted);
        }
        if !file.path.is_file() {
            return Err(DiskError::NotAFile);
        }

        let data = fs::read(&file.path)?;
        tracing::debug!("[DISK {}] READ staged {} bytes", self.drive_num, data.len());
        self.stage(data);
        Ok(None)
    }

    fn list(&mut self) -> CommandResult {
        let listing = self.readable_listing()?;
        self.stage(string_to_latin1(&listing));
        Ok(None)
    }

    fn readable_listing(&self) -> Result<String, DiskError> {
        let file = self.opened()?;
        if file.path.is_file() {
            return Ok(file_name(&file.path));
        }
        if !file.path.is_dir() {
            return Err(DiskError::NoSuchFile(file_name(&file.path)));
        }

        let is_root = file.path == self.root;
        let mut lines = vec![
            format!(
                "Current directory: {}",
                if is_root {
                    "(root)".to_string()
                } else {
                    display_path(&self.root, &file.path)
                }
            ),
            ".".to_string(),
        ];
        if !is_root {
            lines.push("..".to_string());
        }

        for (name, is_dir, len) in sorted_entries(&file.path)? {
            let label = if is_dir { format!("{}/", name) } else { name };
            let line = if is_dir {
                label
            } else {
                format!("{:<width$}{} B", label, len, width = LISTING_COLUMN)
            };
            lines.push(line);
        }

        Ok(lines.join("\n"))
    }

    fn list_files(&mut self) -> CommandResult {
        let file = self.opened()?;
        if !file.path.is_dir() {
            return Err(DiskError::NotADirectory);
        }

        let mut out = Vec::new();
        for (i, (name, is_dir, _)) in sorted_entries(&file.path)?.into_iter().enumerate() {
            if i > 0 {
                out.push(RECORD_SEP);
            }
            out.push(if is_dir { DIRECTORY_TAG } else { FILE_TAG });
            out.extend(string_to_latin1(&name));
        }

        self.stage(out);
        Ok(None)
    }

    fn get_len(&mut self) -> CommandResult {
        let file = self.opened()?;
        let len = if file.path.is_file() {
            fs::metadata(&file.path)?.len()
        } else if file.path.is_dir() {
            fs::read_dir(&file.path)?.count() as u64
        } else {
            return Err(DiskError::NoSuchFile(file_name(&file.path)));
        };

        self.stage(len.to_string().into_bytes());
        Ok(None)
    }

    fn delete(&mut self) -> CommandResult {
        let file = self.opened()?;
        let result = if file.path.is_dir() {
            fs::remove_dir(&file.path)
        } else {
            fs::remove_file(&file.path)
        };

        match result {
            Ok(()) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(DiskError::NoSuchFile(file_name(&file.path)))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn mkdir(&mut self) -> CommandResult {
        let file = self.opened_for_writing()?;
        match fs::create_dir(&file.path) {
            Ok(()) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(DiskError::OperationFailed)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn mkfile(&mut self) -> CommandResult {
        let file = self.opened_for_writing()?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file.path)
        {
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(DiskError::OperationFailed)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn touch(&mut self) -> CommandResult {
        let file = self.opened_for_writing()?;
        if !file.path.exists() {
            return Err(DiskError::OperationFailed);
        }

        let handle = OpenOptions::new().append(true).open(&file.path)?;
        handle.set_modified(SystemTime::now())?;
        Ok(None)
    }

    fn start_write(&mut self, args: &str) -> CommandResult {
        self.opened_for_writing()?;
        let len = strip_terminator(args)
            .trim()
            .parse::<usize>()
            .map_err(|_| DiskError::IllegalCommand(format!("WRITE{}", args)))?;

        tracing::debug!("[DISK {}] WRITE expecting {} bytes", self.drive_num, len);
        self.pending_write = Some(PendingWrite {
            len,
            buffer: Vec::with_capacity(len),
        });

        if len == 0 {
            self.commit_write()?;
        }
        Ok(None)
    }

    fn accept_write_data(&mut self, data: &[u8]) {
        let Some(pending) = self.pending_write.as_mut() else {
            return;
        };

        let wanted = pending.len - pending.buffer.len();
        let take = wanted.min(data.len()).min(BLOCK_SIZE);
        pending.buffer.extend_from_slice(&data[..take]);

        if pending.buffer.len() >= pending.len {
            let status = match self.commit_write() {
                Ok(()) => DeviceStatusCode::Ready,
                Err(err) => {
                    tracing::warn!("[DISK {}] Write failed: {}", self.drive_num, err);
                    err.status_code()
                }
            };
            self.set_status(status);
        }
    }

    fn commit_write(&mut self) -> Result<(), DiskError> {
        let Some(pending) = self.pending_write.take() else {
            return Ok(());
        };
        let file = self.opened_for_writing()?;

        match file.mode {
            OpenMode::Append => {
                let mut handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&file.path)?;
                handle.write_all(&pending.buffer)?;
            }
            _ => fs::write(&file.path, &pending.buffer)?,
        }

        tracing::debug!(
            "[DISK {}] Committed {} bytes to {:?}",
            self.drive_num,
            pending.buffer.len(),
            file.path
        );
        Ok(())
    }

    fn load_boot(&mut self) -> CommandResult {
        let path = self.root.join(BOOT_SECTOR_FILE);
        if !path.is_file() {
            return Err(DiskError::NoSuchFile(BOOT_SECTOR_FILE.to_string()));
        }

        let mut sector = Vec::with_capacity(BLOCK_SIZE);
        File::open(&path)?
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut sector)?;
        sector.resize(BLOCK_SIZE, 0);

        tracing::info!("[DISK {}] Boot sector loaded", self.drive_num);
        Ok(Some(sector))
    }
}

impl BlockTransferInterface for VirtualDiskDrive {
    fn state(&self) -> &TransferState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TransferState {
        &mut self.state
    }

    fn start_send_impl(&mut self, recipient: &mut dyn BlockTransferInterface) -> usize {
        if self.blocks_sent == 0 {
            self.send_buffer = self.compose.clone();
        }

        let start = (self.blocks_sent * BLOCK_SIZE).min(self.send_buffer.len());
        let end = (start + BLOCK_SIZE).min(self.send_buffer.len());
        recipient.writeout(&self.send_buffer[start..end]);
        self.blocks_sent = self.blocks_sent.saturating_add(1);

        tracing::trace!(
            "[DISK {}] Sent block {} ({} bytes)",
            self.drive_num,
            self.blocks_sent,
            end - start
        );
        end - start
    }

    fn writeout_impl(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if self.pending_write.is_some() {
            self.accept_write_data(data);
            return None;
        }

        let command = latin1_to_string(trim_null(data));
        if command.starts_with("DEVSTU\x17") {
            return Some(self.status_frame());
        }
        if command.starts_with("DEVTYP\x17") {
            return Some(compose_positive_answer(&[b"STOR"]));
        }
        if command.starts_with("DEVNAM\x17") {
            return Some(compose_positive_answer(&[&string_to_latin1(&self.name)]));
        }

        tracing::debug!("[DISK {}] Command {:?}", self.drive_num, command);
        match self.execute(&command) {
            Ok(reply) => {
                self.set_status(DeviceStatusCode::Ready);
                reply
            }
            Err(err) => {
                let status = err.status_code();
                if status.is_error() {
                    tracing::warn!("[DISK {}] {} -> {}", self.drive_num, err, status);
                } else {
                    tracing::debug!("[DISK {}] {} -> {}", self.drive_num, err, status);
                }
                self.set_status(status);
                None
            }
        }
    }

    fn has_next(&self) -> bool {
        self.remaining() > 0
    }
}

fn strip_terminator(args: &str) -> &str {
    args.trim_end_matches(END_OF_SEND_BLOCK as char)
}

/// Normalises separators and replaces characters hosts tend to reject.
pub fn sanitise_path(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '\\' => '/',
            '?' | '<' | '>' | ':' | '*' | '|' => '-',
            c => c,
        })
        .collect()
}

/// Resolves `.` and `..` so the result is relative and never climbs above the root.
pub fn clamp_to_root(path: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part.trim() {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    parts.iter().collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

fn sorted_entries(dir: &Path) -> Result<Vec<(String, bool, u64)>, DiskError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            metadata.is_dir(),
            metadata.len(),
        ));
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitise_path() {
        assert_eq!(sanitise_path("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(sanitise_path("what?<is>:this*|"), "what--is--this--");
    }

    #[test]
    fn test_clamp_to_root() {
        assert_eq!(clamp_to_root("../../etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(clamp_to_root("a/./b/../c"), PathBuf::from("a/c"));
        assert_eq!(clamp_to_root("/abs/path"), PathBuf::from("abs/path"));
        assert_eq!(clamp_to_root(""), PathBuf::new());
        assert_eq!(clamp_to_root("a/../../.."), PathBuf::new());
    }

    #[test]
    fn test_status_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = VirtualDiskDrive::new(dir.path(), 0).unwrap();
        assert_eq!(drive.status_frame(), b"\x06\x00\x1FREADY\x17");

        drive.set_status(DeviceStatusCode::NoSuchFileExists);
        assert_eq!(
            drive.status_frame(),
            b"\x15\x81\x1FNO SUCH FILE EXISTS\x17".to_vec()
        );
    }

    #[test]
    fn test_open_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = VirtualDiskDrive::new(dir.path(), 0).unwrap();

        drive.writeout(b"OPENX\"a\"");
        assert_eq!(drive.status(), Some(DeviceStatusCode::IllegalCommand));
        drive.writeout(b"OPENW\"a\",x");
        assert_eq!(drive.status(), Some(DeviceStatusCode::IllegalCommand));
        drive.writeout(b"OPENW\"a");
        assert_eq!(drive.status(), Some(DeviceStatusCode::IllegalCommand));

        drive.writeout(b"OPENW\"a\",1");
        assert_eq!(drive.status(), Some(DeviceStatusCode::Ready));
        assert_eq!(
            drive.open_file().map(|f| f.mode),
            Some(OpenMode::Write)
        );
    }

    #[test]
    fn test_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut drive = VirtualDiskDrive::new(dir.path(), 0).unwrap();
        drive.writeout(b"FORMAT C:");
        assert_eq!(drive.status(), Some(DeviceStatusCode::IllegalCommand));
    }
}
