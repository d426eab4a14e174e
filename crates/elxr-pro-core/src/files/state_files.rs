//! Small state records written alongside the machine token.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DataFile, JsonFile};
use crate::config::PRIVATE_SUBDIR;
use crate::error::Result;

pub const ATTACHMENT_FILE: &str = "attachment.json";
pub const MACHINE_ID_FILE: &str = "machine-id";

/// When the machine was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentData {
    pub attached_at: DateTime<Utc>,
}

/// Attachment timestamp and cached machine id.
#[derive(Debug, Clone)]
pub struct StateFiles {
    pub attachment: JsonFile<AttachmentData>,
    pub machine_id: DataFile,
}

impl StateFiles {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            attachment: JsonFile::new(DataFile::new(data_dir, ATTACHMENT_FILE, false)),
            machine_id: DataFile::new(&data_dir.join(PRIVATE_SUBDIR), MACHINE_ID_FILE, true),
        }
    }

    /// Persist the machine id and the attachment time.
    pub fn record_attachment(&self, machine_id: &str, attached_at: DateTime<Utc>) -> Result<()> {
        self.machine_id.write(machine_id)?;
        self.attachment.write(&AttachmentData { attached_at })
    }

    pub fn delete_all(&self) -> Result<()> {
        self.machine_id.delete()?;
        self.attachment.delete()
    }
}
