//! Update and patch records.
//!
//! Records are typed structs with a separate [`PropertyBag`] for attributes
//! the schema does not know about. Both the remote manifest and the local
//! record files use the same element shape:
//!
//! ```xml
//! <updates>
//!   <update appVersion="129.0" type="minor">
//!     <patch type="complete" URL="https://..." size="1000"/>
//!   </update>
//! </updates>
//! ```
//!
//! Attribute values are strings. Unknown attributes are kept verbatim.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::status::UpdateStatus;

/// Attribute names owned by [`PatchRecord`].
pub const PATCH_ATTRIBUTES: &[&str] =
    &["errorCode", "finalURL", "selected", "size", "state", "type", "URL"];

/// Attribute names owned by [`UpdateRecord`].
pub const UPDATE_ATTRIBUTES: &[&str] = &[
    "appVersion",
    "buildID",
    "channel",
    "detailsURL",
    "displayVersion",
    "elevationFailure",
    "errorCode",
    "installDate",
    "isCompleteUpdate",
    "name",
    "previousAppVersion",
    "promptWaitTime",
    "serviceURL",
    "state",
    "statusText",
    "type",
    "unsupported",
    "platformVersion",
];

/// Well-known extension property names.
pub mod props {
    /// Job id handed out by the native transfer service.
    pub const NATIVE_JOB_ID: &str = "nativeJobId";
    /// Result code of the last native transfer of this patch.
    pub const NATIVE_RESULT: &str = "nativeResult";
    /// Result code of the last chunked transfer of this patch.
    pub const CHUNKED_RESULT: &str = "chunkedResult";
    /// Install attempts made with this patch.
    pub const TOTAL_INSTALL_ATTEMPTS: &str = "numTotalInstallAttempts";
    /// Update-level: never use the native transfer backend.
    pub const DISABLE_NATIVE_TRANSFER: &str = "disableNativeTransfer";
    /// Update-level: do not download this update from a background task.
    pub const DISABLE_BACKGROUND_UPDATES: &str = "disableBackgroundUpdates";
    /// Optional digest algorithm for the patch file.
    pub const HASH_FUNCTION: &str = "hashFunction";
    /// Optional hex digest of the patch file.
    pub const HASH_VALUE: &str = "hashValue";
}

/// Ordered string map that refuses keys owned by the fixed schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBag {
    reserved: &'static [&'static str],
    entries: BTreeMap<String, String>,
}

impl PropertyBag {
    fn new(reserved: &'static [&'static str]) -> Self {
        Self { reserved, entries: BTreeMap::new() }
    }

    fn check(&self, name: &str) -> Result<(), UpdateError> {
        if self.reserved.contains(&name) {
            return Err(UpdateError::ReservedProperty(name.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Sets a property. Fails if `name` is a fixed attribute.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), UpdateError> {
        self.check(name)?;
        self.entries.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Removes a property, returning its value.
    pub fn remove(&mut self, name: &str) -> Result<Option<String>, UpdateError> {
        self.check(name)?;
        Ok(self.entries.remove(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sets a well-known property. Only used with names from [`props`],
    /// which never collide with fixed attributes.
    pub(crate) fn set_known(&mut self, name: &'static str, value: impl Into<String>) {
        debug_assert!(!self.reserved.contains(&name));
        self.entries.insert(name.to_string(), value.into());
    }

    pub(crate) fn remove_known(&mut self, name: &'static str) {
        self.entries.remove(name);
    }
}

/// Attributes of a `<patch>` element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchElement {
    pub attributes: BTreeMap<String, String>,
}

/// Attributes of an `<update>` element and its patches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateElement {
    pub attributes: BTreeMap<String, String>,
    pub patches: Vec<PatchElement>,
}

/// Root `<updates>` element of a record file or manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDocument {
    pub updates: Vec<UpdateElement>,
}

impl UpdateDocument {
    /// Reads a document. Elements other than `updates`, `update` and
    /// `patch` are ignored, as are namespace declarations.
    ///
    /// # Errors
    ///
    /// Malformed XML, or no `<updates>` root.
    pub fn from_xml(bytes: &[u8]) -> Result<Self, UpdateError> {
        let text = std::str::from_utf8(bytes).map_err(|e| UpdateError::XmlError(e.to_string()))?;
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut document: Option<UpdateDocument> = None;
        let mut current: Option<UpdateElement> = None;
        loop {
            let (element, empty) = match reader.read_event()? {
                Event::Start(e) => (e, false),
                Event::Empty(e) => (e, true),
                Event::End(e) => {
                    if e.local_name().as_ref() == b"update" {
                        if let (Some(document), Some(update)) = (document.as_mut(), current.take()) {
                            document.updates.push(update);
                        }
                    }
                    continue;
                }
                Event::Eof => break,
                _ => continue,
            };

            match element.local_name().as_ref() {
                b"updates" => {
                    document.get_or_insert_with(UpdateDocument::default);
                }
                b"update" => {
                    let Some(document) = document.as_mut() else {
                        continue;
                    };
                    let update = UpdateElement { attributes: read_attributes(&element)?, patches: Vec::new() };
                    if empty {
                        document.updates.push(update);
                    } else {
                        current = Some(update);
                    }
                }
                b"patch" => {
                    if let Some(update) = current.as_mut() {
                        update.patches.push(PatchElement { attributes: read_attributes(&element)? });
                    }
                }
                _ => {}
            }
        }

        document.ok_or_else(|| UpdateError::UnknownManifestSchema("missing updates element".to_string()))
    }

    /// Writes the document with an XML declaration, indented by two spaces.
    pub fn to_xml(&self) -> Result<Vec<u8>, UpdateError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_error)?;
        writer.write_event(Event::Start(BytesStart::new("updates"))).map_err(write_error)?;
        for update in &self.updates {
            let mut start = BytesStart::new("update");
            for (name, value) in &update.attributes {
                start.push_attribute((name.as_str(), value.as_str()));
            }
            if update.patches.is_empty() {
                writer.write_event(Event::Empty(start)).map_err(write_error)?;
                continue;
            }
            writer.write_event(Event::Start(start)).map_err(write_error)?;
            for patch in &update.patches {
                let mut element = BytesStart::new("patch");
                for (name, value) in &patch.attributes {
                    element.push_attribute((name.as_str(), value.as_str()));
                }
                writer.write_event(Event::Empty(element)).map_err(write_error)?;
            }
            writer.write_event(Event::End(BytesEnd::new("update"))).map_err(write_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("updates"))).map_err(write_error)?;
        Ok(writer.into_inner())
    }
}

fn read_attributes(element: &BytesStart<'_>) -> Result<BTreeMap<String, String>, UpdateError> {
    let mut attributes = BTreeMap::new();
    for attribute in element.attributes() {
        let attribute = attribute?;
        let name = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        if name == "xmlns" || name.starts_with("xmlns:") {
            continue;
        }
        let value = attribute.unescape_value().map_err(write_error)?.into_owned();
        attributes.insert(name, value);
    }
    Ok(attributes)
}

fn write_error(err: impl fmt::Display) -> UpdateError {
    UpdateError::XmlError(err.to_string())
}

/// Drops attributes that were serialized from an absent value.
fn attribute_string(value: &str) -> Option<String> {
    match value {
        "undefined" => None,
        other => Some(other.to_string()),
    }
}

fn attr(value: impl ToString) -> String {
    value.to_string()
}

/// `complete` or `partial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchType {
    Complete,
    Partial,
}

impl PatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchType::Complete => "complete",
            PatchType::Partial => "partial",
        }
    }
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatchType {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(PatchType::Complete),
            "partial" => Ok(PatchType::Partial),
            other => Err(UpdateError::InvalidRecord(format!("unknown patch type {}", other))),
        }
    }
}

/// `major`, `minor`, or a type this engine does not handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpdateType {
    Major,
    Minor,
    Other(String),
}

impl UpdateType {
    pub fn as_str(&self) -> &str {
        match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Other(s) => s,
        }
    }
}

impl From<&str> for UpdateType {
    fn from(s: &str) -> Self {
        match s {
            "major" => UpdateType::Major,
            "minor" => UpdateType::Minor,
            other => UpdateType::Other(other.to_string()),
        }
    }
}

/// One downloadable artifact of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub patch_type: PatchType,
    pub url: String,
    pub final_url: Option<String>,
    pub size: u64,
    pub state: UpdateStatus,
    pub error_code: i32,
    pub selected: bool,
    pub properties: PropertyBag,
}

impl PatchRecord {
    pub fn new(patch_type: PatchType, url: impl Into<String>, size: u64) -> Self {
        Self {
            patch_type,
            url: url.into(),
            final_url: None,
            size,
            state: UpdateStatus::None,
            error_code: 0,
            selected: false,
            properties: PropertyBag::new(PATCH_ATTRIBUTES),
        }
    }

    /// Parses a patch element. Zero or unparsable sizes are rejected.
    pub fn from_element(element: &PatchElement) -> Result<Self, UpdateError> {
        let mut patch_type = None;
        let mut url = None;
        let mut size = None;
        let mut patch = PatchRecord::new(PatchType::Complete, String::new(), 1);

        for (name, value) in &element.attributes {
            let Some(value) = attribute_string(value) else {
                continue;
            };
            match name.as_str() {
                "selected" => patch.selected = value == "true",
                "size" => {
                    let parsed: u64 = value.trim().parse().map_err(|_| {
                        UpdateError::InvalidRecord(format!("invalid patch size {}", value))
                    })?;
                    if parsed == 0 {
                        return Err(UpdateError::InvalidRecord("zero-sized patch".to_string()));
                    }
                    size = Some(parsed);
                }
                "errorCode" => patch.error_code = value.trim().parse().unwrap_or(0),
                "finalURL" => patch.final_url = Some(value),
                "state" => {
                    patch.state = value.parse().unwrap_or_else(|_| {
                        warn!("Unknown patch state {}, treating as null", value);
                        UpdateStatus::None
                    })
                }
                "type" => patch_type = Some(value.parse::<PatchType>()?),
                "URL" => url = Some(value),
                _ => patch.properties.set(name, value)?,
            }
        }

        patch.patch_type =
            patch_type.ok_or_else(|| UpdateError::InvalidRecord("patch without type".into()))?;
        patch.url = url.ok_or_else(|| UpdateError::InvalidRecord("patch without URL".into()))?;
        patch.size = size.ok_or_else(|| UpdateError::InvalidRecord("patch without size".into()))?;
        Ok(patch)
    }

    pub fn to_element(&self) -> PatchElement {
        let mut attributes = BTreeMap::new();
        attributes.insert("size".to_string(), attr(self.size));
        attributes.insert("type".to_string(), attr(self.patch_type));
        attributes.insert("URL".to_string(), attr(&self.url));
        if self.error_code != 0 {
            attributes.insert("errorCode".to_string(), attr(self.error_code));
        }
        if let Some(final_url) = &self.final_url {
            attributes.insert("finalURL".to_string(), attr(final_url));
        }
        if self.selected {
            attributes.insert("selected".to_string(), attr("true"));
        }
        if self.state != UpdateStatus::None {
            attributes.insert("state".to_string(), attr(self.state));
        }
        for (name, value) in self.properties.iter() {
            attributes.insert(name.to_string(), attr(value));
        }
        PatchElement { attributes }
    }
}

/// Values filled in when a parsed update omits them.
#[derive(Debug, Clone)]
pub struct RecordDefaults {
    /// Display name of the application, used for the default update name
    pub app_name: String,
    /// Running application version, used for `previousAppVersion`
    pub app_version: String,
    /// Fallback details URL
    pub details_url: String,
    /// Default prompt wait time in seconds
    pub prompt_wait_time: u64,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            app_name: "Application".to_string(),
            app_version: "0".to_string(),
            details_url: String::new(),
            prompt_wait_time: 43_200,
        }
    }
}

/// One discovered update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub app_version: Option<String>,
    pub build_id: Option<String>,
    pub channel: String,
    pub update_type: Option<UpdateType>,
    pub name: String,
    pub display_version: Option<String>,
    pub details_url: String,
    pub platform_version: Option<String>,
    /// Milliseconds since the Unix epoch
    pub install_date: i64,
    pub unsupported: bool,
    pub is_complete_update: bool,
    pub elevation_failure: bool,
    pub previous_app_version: Option<String>,
    /// Seconds
    pub prompt_wait_time: u64,
    pub service_url: Option<String>,
    pub status_text: Option<String>,
    pub patches: Vec<PatchRecord>,
    pub properties: PropertyBag,
    state: UpdateStatus,
    error_code: i32,
}

impl UpdateRecord {
    /// A record with no version that stands in for "nothing", e.g. the
    /// result of a failed check.
    pub fn placeholder() -> Self {
        Self {
            app_version: None,
            build_id: None,
            channel: "default".to_string(),
            update_type: None,
            name: String::new(),
            display_version: None,
            details_url: String::new(),
            platform_version: None,
            install_date: chrono::Utc::now().timestamp_millis(),
            unsupported: false,
            is_complete_update: false,
            elevation_failure: false,
            previous_app_version: None,
            prompt_wait_time: 43_200,
            service_url: None,
            status_text: None,
            patches: Vec::new(),
            properties: PropertyBag::new(UPDATE_ATTRIBUTES),
            state: UpdateStatus::None,
            error_code: 0,
        }
    }

    /// Builds an update for `app_version` with the given patches.
    pub fn new(app_version: impl Into<String>, update_type: UpdateType, patches: Vec<PatchRecord>) -> Self {
        let app_version = app_version.into();
        Self {
            display_version: Some(app_version.clone()),
            name: format!("Update {}", app_version),
            app_version: Some(app_version),
            update_type: Some(update_type),
            patches,
            ..Self::placeholder()
        }
    }

    /// Parses an update element, skipping invalid patches.
    ///
    /// # Errors
    ///
    /// Fails if the element has no `appVersion`, or has no valid patch and
    /// is not marked unsupported.
    pub fn from_element(element: &UpdateElement, defaults: &RecordDefaults) -> Result<Self, UpdateError> {
        let mut update = Self::placeholder();
        update.prompt_wait_time = defaults.prompt_wait_time;

        for patch in &element.patches {
            match PatchRecord::from_element(patch) {
                Ok(patch) => update.patches.push(patch),
                Err(e) => debug!("Skipping invalid patch: {}", e),
            }
        }

        let has_unsupported = element.attributes.contains_key("unsupported");
        if update.patches.is_empty() && !has_unsupported {
            return Err(UpdateError::InvalidRecord("update has no valid patches".to_string()));
        }

        let mut name = None;
        let mut details_url = None;
        for (key, value) in &element.attributes {
            let Some(value) = attribute_string(value) else {
                continue;
            };
            match key.as_str() {
                "appVersion" => update.app_version = Some(value),
                "buildID" => update.build_id = Some(value),
                "channel" => update.channel = value,
                "detailsURL" => details_url = Some(value),
                "displayVersion" => update.display_version = Some(value),
                "elevationFailure" => update.elevation_failure = value == "true",
                "errorCode" => update.error_code = value.trim().parse().unwrap_or(0),
                "installDate" => {
                    if let Ok(date) = value.trim().parse::<i64>() {
                        if date != 0 {
                            update.install_date = date;
                        }
                    }
                }
                "isCompleteUpdate" => update.is_complete_update = value == "true",
                "name" => name = Some(value),
                "previousAppVersion" => update.previous_app_version = Some(value),
                "promptWaitTime" => {
                    if let Ok(wait) = value.trim().parse() {
                        update.prompt_wait_time = wait;
                    }
                }
                "serviceURL" => update.service_url = Some(value),
                "state" => update.state = value.parse().unwrap_or_default(),
                "statusText" => update.status_text = Some(value),
                "type" => update.update_type = Some(UpdateType::from(value.as_str())),
                "unsupported" => update.unsupported = value == "true",
                "platformVersion" => update.platform_version = Some(value),
                _ => update.properties.set(key, value)?,
            }
        }

        if update.app_version.is_none() {
            return Err(UpdateError::InvalidRecord("update without appVersion".to_string()));
        }
        if update.previous_app_version.is_none() {
            update.previous_app_version = Some(defaults.app_version.clone());
        }
        update.details_url = details_url.unwrap_or_else(|| defaults.details_url.clone());
        if update.display_version.is_none() {
            update.display_version = update.app_version.clone();
        }
        update.name = name.unwrap_or_else(|| {
            format!(
                "{} {}",
                defaults.app_name,
                update.display_version.as_deref().unwrap_or_default()
            )
        });

        Ok(update)
    }

    /// Serializes the update. Placeholders without a version serialize to
    /// nothing.
    pub fn to_element(&self) -> Option<UpdateElement> {
        let app_version = self.app_version.as_ref()?;
        let mut attributes = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            attributes.insert(k.to_string(), v);
        };

        put("appVersion", attr(app_version));
        if let Some(build_id) = &self.build_id {
            put("buildID", attr(build_id));
        }
        put("channel", attr(&self.channel));
        put("detailsURL", attr(&self.details_url));
        if let Some(display_version) = &self.display_version {
            put("displayVersion", attr(display_version));
        }
        if let Some(platform_version) = &self.platform_version {
            put("platformVersion", attr(platform_version));
        }
        put("installDate", attr(self.install_date));
        put("isCompleteUpdate", attr(self.is_complete_update));
        put("name", attr(&self.name));
        if let Some(previous) = &self.previous_app_version {
            put("previousAppVersion", attr(previous));
        }
        put("promptWaitTime", attr(self.prompt_wait_time));
        if let Some(service_url) = &self.service_url {
            put("serviceURL", attr(service_url));
        }
        if let Some(update_type) = &self.update_type {
            put("type", attr(update_type.as_str()));
        }
        if let Some(status_text) = &self.status_text {
            put("statusText", attr(status_text));
        }
        if self.unsupported {
            put("unsupported", attr("true"));
        }
        if self.elevation_failure {
            put("elevationFailure", attr("true"));
        }
        if self.state != UpdateStatus::None {
            put("state", attr(self.state));
        }
        if self.error_code != 0 {
            put("errorCode", attr(self.error_code));
        }
        for (name, value) in self.properties.iter() {
            put(name, attr(value));
        }

        Some(UpdateElement {
            attributes,
            patches: self.patches.iter().map(PatchRecord::to_element).collect(),
        })
    }

    pub fn selected_patch(&self) -> Option<&PatchRecord> {
        self.patches.iter().find(|p| p.selected)
    }

    pub fn selected_patch_mut(&mut self) -> Option<&mut PatchRecord> {
        self.patches.iter_mut().find(|p| p.selected)
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.patches.iter().position(|p| p.selected)
    }

    pub fn patch_of_type(&self, patch_type: PatchType) -> Option<&PatchRecord> {
        self.patches.iter().find(|p| p.patch_type == patch_type)
    }

    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Lifecycle state; delegates to the selected patch when there is one.
    pub fn state(&self) -> UpdateStatus {
        self.selected_patch().map(|p| p.state).unwrap_or(self.state)
    }

    pub fn set_state(&mut self, state: UpdateStatus) {
        if let Some(patch) = self.selected_patch_mut() {
            patch.state = state;
        }
        self.state = state;
    }

    /// Error code; delegates to the selected patch when there is one.
    pub fn error_code(&self) -> i32 {
        self.selected_patch().map(|p| p.error_code).unwrap_or(self.error_code)
    }

    pub fn set_error_code(&mut self, code: i32) {
        if let Some(patch) = self.selected_patch_mut() {
            patch.error_code = code;
        }
        self.error_code = code;
    }

    /// Marks the update failed with `code` and a matching status text.
    pub fn mark_failed(&mut self, code: i32) {
        self.set_state(UpdateStatus::Failed);
        self.set_error_code(code);
        self.status_text = Some(crate::codes::status_text(code));
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.app_version.as_deref().unwrap_or("<none>"),
            self.build_id.as_deref().unwrap_or("?")
        )
    }
}

/// Parses a record file or manifest document.
///
/// Invalid entries are skipped. A document without an `<updates>` root is
/// rejected as an unknown schema.
pub fn parse_document(bytes: &[u8], defaults: &RecordDefaults) -> Result<Vec<UpdateRecord>, UpdateError> {
    let document = UpdateDocument::from_xml(bytes)?;
    let mut updates = Vec::new();
    for element in &document.updates {
        match UpdateRecord::from_element(element, defaults) {
            Ok(update) => updates.push(update),
            Err(e) => debug!("Skipping invalid update: {}", e),
        }
    }
    Ok(updates)
}

/// Serializes records into a document. Placeholders are left out.
pub fn to_document<'a>(updates: impl IntoIterator<Item = &'a UpdateRecord>) -> UpdateDocument {
    UpdateDocument {
        updates: updates.into_iter().filter_map(UpdateRecord::to_element).collect(),
    }
}
