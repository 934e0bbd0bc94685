//! The document passed from a backup run to a later restore run.

use std::{fmt, io};

use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    changemap::ChangeMap,
    error::{Error, Result},
};

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnParams {
    #[serde(rename = "VmMoRef")]
    pub vm_mo_ref: String,
    #[serde(rename = "VsphereHostName")]
    pub host: String,
    #[serde(rename = "VsphereHostPort")]
    pub port: u16,
    #[serde(rename = "VsphereUsername")]
    pub username: String,
    #[serde(rename = "VspherePassword")]
    pub password: String,
    #[serde(rename = "VsphereThumbPrint")]
    pub thumbprint: String,
    #[serde(rename = "VsphereSnapshotMoRef")]
    pub snapshot_mo_ref: String,
}

impl fmt::Debug for ConnParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnParams")
            .field("vm_mo_ref", &self.vm_mo_ref)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("thumbprint", &self.thumbprint)
            .field("snapshot_mo_ref", &self.snapshot_mo_ref)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskParams {
    pub disk_path: String,
    pub disk_path_root: String,
    pub change_id: String,
}

impl DiskParams {
    /// Path handed to the library when opening the remote disk: the root
    /// path when one is given, the disk path otherwise.
    pub fn remote_path(&self) -> &str {
        if self.disk_path_root.is_empty() {
            &self.disk_path
        } else {
            &self.disk_path_root
        }
    }
}

/// How to treat a document that does not parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseMode {
    /// Fail with [`Error::Document`].
    #[default]
    Strict,
    /// Log the problem and keep whatever parsed; each block falls back to
    /// its default independently.
    Lenient,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbtDocument {
    #[serde(rename = "ConnParams", default)]
    pub conn: ConnParams,
    #[serde(rename = "DiskParams", default)]
    pub disk: DiskParams,
    #[serde(rename = "DiskChangeInfo", default)]
    pub change: ChangeMap,
}

impl CbtDocument {
    pub fn parse(input: impl io::Read, mode: ParseMode) -> Result<Self> {
        match mode {
            ParseMode::Strict => {
                let doc: CbtDocument = serde_json::from_reader(input)?;
                doc.change.validate()?;
                Ok(doc)
            }
            ParseMode::Lenient => Ok(Self::parse_lenient(input)),
        }
    }

    fn parse_lenient(input: impl io::Read) -> Self {
        let value: serde_json::Value = match serde_json::from_reader(input) {
            Ok(v) => v,
            Err(e) => {
                warn!("CBT document unreadable, using empty document: {}", e);
                return Self::default();
            }
        };

        let mut doc = CbtDocument {
            conn: lenient_block(&value, "ConnParams"),
            disk: lenient_block(&value, "DiskParams"),
            change: lenient_block(&value, "DiskChangeInfo"),
        };
        if let Err(e) = doc.change.validate() {
            warn!("Dropping change information: {}", e);
            doc.change = ChangeMap::default();
        }
        doc
    }

    pub fn write(&self, out: impl io::Write) -> Result<()> {
        serde_json::to_writer_pretty(out, self)?;
        Ok(())
    }
}

fn lenient_block<T: DeserializeOwned + Default>(value: &serde_json::Value, name: &str) -> T {
    match value.get(name) {
        None => T::default(),
        Some(v) => T::deserialize(v).unwrap_or_else(|e| {
            warn!("Ignoring malformed {} block: {}", name, e);
            T::default()
        }),
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Document(e.to_string())
    }
}
