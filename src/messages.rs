//! Control messages: binary plist dictionaries exchanged on `/Discover` and `/Ask`

use std::io::Cursor;

use plist::{Dictionary, Value};
use serde_json::json;

use crate::entity::Entity;
use crate::error::{AskError, MessageError};
use crate::file_types;
use crate::protocol::{self, keys};

/// Serialize a dictionary as a binary plist.
pub fn encode_dictionary(dict: &Dictionary) -> Result<Vec<u8>, MessageError> {
    let mut out = Vec::new();
    Value::Dictionary(dict.clone()).to_writer_binary(&mut out)?;
    Ok(out)
}

/// Parse a plist body (binary or XML). An empty body is an empty dictionary.
pub fn decode_dictionary(body: &[u8]) -> Result<Dictionary, MessageError> {
    if body.is_empty() {
        return Ok(Dictionary::new());
    }
    match Value::from_reader(Cursor::new(body))? {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(MessageError::NotDictionary),
    }
}

fn string_field(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

/// One entry of the `Files` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    /// Uniform type identifier, e.g. `public.jpeg`.
    pub file_type: String,
    /// Archive-relative path of the record carrying this file.
    pub path: String,
}

impl FileDescriptor {
    pub fn for_entity(entity: &dyn Entity) -> Self {
        Self {
            name: entity.name().to_string(),
            file_type: file_types::uti_for(entity.mime_type(), entity.name()).to_string(),
            path: entity.path().to_string(),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        file_types::mime_for_uti(&self.file_type)
    }

    fn to_dictionary(&self) -> Dictionary {
        let mut file = Dictionary::new();
        file.insert(keys::FILE_NAME.into(), Value::String(self.name.clone()));
        file.insert(keys::FILE_TYPE.into(), Value::String(self.file_type.clone()));
        file.insert(keys::FILE_BOM_PATH.into(), Value::String(self.path.clone()));
        file.insert(keys::FILE_IS_DIRECTORY.into(), Value::Boolean(false));
        file.insert(keys::CONVERT_MEDIA_FORMATS.into(), Value::Integer(0i64.into()));
        file
    }

    /// Entries lacking a type or a path are unusable and yield `None`.
    fn from_value(value: &Value) -> Option<Self> {
        let dict = value.as_dictionary()?;
        let file_type = string_field(dict, keys::FILE_TYPE)?;
        let path = string_field(dict, keys::FILE_BOM_PATH)?;
        let name = string_field(dict, keys::FILE_NAME).unwrap_or_else(|| basename(&path).to_string());
        Some(Self { name, file_type, path })
    }
}

/// Last non-empty segment of an archive path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    pub sender_id: String,
    pub sender_name: String,
    pub files: Vec<FileDescriptor>,
    pub icon: Option<Vec<u8>>,
}

impl AskRequest {
    pub fn new(sender_id: &str, sender_name: &str, entities: &[std::sync::Arc<dyn Entity>], icon: Option<Vec<u8>>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            files: entities.iter().map(|e| FileDescriptor::for_entity(e.as_ref())).collect(),
            icon,
        }
    }

    pub fn to_dictionary(&self) -> Dictionary {
        let mut req = Dictionary::new();
        req.insert(keys::SENDER_ID.into(), Value::String(self.sender_id.clone()));
        req.insert(keys::SENDER_COMPUTER_NAME.into(), Value::String(self.sender_name.clone()));
        req.insert(keys::BUNDLE_ID.into(), Value::String(protocol::BUNDLE_ID.into()));
        req.insert(keys::CONVERT_MEDIA_FORMATS.into(), Value::Boolean(false));
        let files = self.files.iter().map(|f| Value::Dictionary(f.to_dictionary())).collect();
        req.insert(keys::FILES.into(), Value::Array(files));
        if let Some(icon) = &self.icon {
            req.insert(keys::FILE_ICON.into(), Value::Data(icon.clone()));
        }
        req
    }

    pub fn from_dictionary(dict: &Dictionary) -> Result<Self, AskError> {
        let sender_id = string_field(dict, keys::SENDER_ID).ok_or(AskError::MissingSenderId)?;
        let sender_name = string_field(dict, keys::SENDER_COMPUTER_NAME).ok_or(AskError::MissingSenderName)?;
        let files = dict
            .get(keys::FILES)
            .ok_or(AskError::MissingFiles)?
            .as_array()
            .ok_or(AskError::FilesNotArray)?;
        let files: Vec<FileDescriptor> = files.iter().filter_map(FileDescriptor::from_value).collect();
        if files.is_empty() {
            return Err(AskError::NoFiles);
        }
        let icon = dict.get(keys::FILE_ICON).and_then(Value::as_data).map(<[u8]>::to_vec);
        Ok(Self { sender_id, sender_name, files, icon })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskResponse {
    pub model_name: String,
    pub computer_name: String,
}

impl AskResponse {
    pub fn to_dictionary(&self) -> Dictionary {
        let mut resp = Dictionary::new();
        resp.insert(keys::RECEIVER_MODEL_NAME.into(), Value::String(self.model_name.clone()));
        resp.insert(keys::RECEIVER_COMPUTER_NAME.into(), Value::String(self.computer_name.clone()));
        resp
    }
}

/// Capability document advertised by this implementation.
pub fn own_capabilities() -> serde_json::Value {
    let mut vendor = serde_json::Map::new();
    vendor.insert(
        protocol::VENDOR_NAMESPACE.to_string(),
        json!({ "APIVersion": protocol::VENDOR_API_VERSION }),
    );
    json!({ "Version": protocol::CAPABILITY_VERSION, "Vendor": vendor })
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoverResponse {
    pub computer_name: String,
    pub capabilities: Option<serde_json::Value>,
}

impl DiscoverResponse {
    pub fn to_dictionary(&self) -> Result<Dictionary, MessageError> {
        let mut resp = Dictionary::new();
        resp.insert(keys::RECEIVER_COMPUTER_NAME.into(), Value::String(self.computer_name.clone()));
        if let Some(caps) = &self.capabilities {
            // Embedded as UTF-8 JSON bytes, not as nested plist fields.
            resp.insert(keys::RECEIVER_MEDIA_CAPABILITIES.into(), Value::Data(serde_json::to_vec(caps)?));
        }
        Ok(resp)
    }

    /// `None` when the peer did not name itself. Unparseable capabilities are dropped.
    pub fn from_dictionary(dict: &Dictionary) -> Option<Self> {
        let computer_name = string_field(dict, keys::RECEIVER_COMPUTER_NAME)?;
        let capabilities = dict
            .get(keys::RECEIVER_MEDIA_CAPABILITIES)
            .and_then(Value::as_data)
            .and_then(|bytes| serde_json::from_slice(bytes).ok());
        Some(Self { computer_name, capabilities })
    }
}
