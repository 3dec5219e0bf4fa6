//! Profile data model and definition parsing.
//!
//! A [`Profile`] is the immutable description of one reporting configuration.
//! Runtime state (flags, marker values, cached reports) lives in the registry
//! entry that owns the profile.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{ProfileError, ProfileResult};
use crate::marker::{EventMarker, GrepMarker, MarkerKind};

// ----------------------------------------------------------------------------
// Encoding, Format & Protocol
// ----------------------------------------------------------------------------

/// Payload encoding of a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingType {
    Json,
    MessagePack,
    /// Anything else; rejected when the report is generated
    Other(String),
}

impl EncodingType {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "json" => EncodingType::Json,
            "messagepack" | "msgpack" => EncodingType::MessagePack,
            _ => EncodingType::Other(value.to_string()),
        }
    }
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingType::Json => write!(f, "JSON"),
            EncodingType::MessagePack => write!(f, "MessagePack"),
            EncodingType::Other(other) => write!(f, "{}", other),
        }
    }
}

/// Layout of the JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonFormat {
    NameValuePair,
    ObjectHierarchy,
    Other(String),
}

impl JsonFormat {
    pub fn parse(value: &str) -> Self {
        match value {
            "NameValuePair" => JsonFormat::NameValuePair,
            "ObjectHierarchy" => JsonFormat::ObjectHierarchy,
            _ => JsonFormat::Other(value.to_string()),
        }
    }
}

impl fmt::Display for JsonFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonFormat::NameValuePair => write!(f, "NameValuePair"),
            JsonFormat::ObjectHierarchy => write!(f, "ObjectHierarchy"),
            JsonFormat::Other(other) => write!(f, "{}", other),
        }
    }
}

/// Send protocol of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Other(String),
}

impl Protocol {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("http") {
            Protocol::Http
        } else {
            Protocol::Other(value.to_string())
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Other(other) => write!(f, "{}", other),
        }
    }
}

// ----------------------------------------------------------------------------
// Parameters & Destination
// ----------------------------------------------------------------------------

/// A data-model parameter collected on every report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Data-model path handed to the parameter source
    pub reference: String,
    pub alias: Option<String>,
    pub report_empty: bool,
}

impl Param {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            alias: None,
            report_empty: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn report_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.reference)
    }
}

/// A constant name/value pair written at the top of every report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticParam {
    pub name: String,
    pub value: String,
}

impl StaticParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Query parameter appended to the destination URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUriParam {
    #[serde(rename = "Name")]
    pub name: String,
    /// Data-model path resolved when no literal value is given
    #[serde(rename = "Reference", default)]
    pub reference: Option<String>,
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

/// Where HTTP reports go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDestination {
    pub url: String,
    pub request_uri_params: Vec<RequestUriParam>,
}

impl HttpDestination {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_uri_params: Vec::new(),
        }
    }

    pub fn with_literal_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_uri_params.push(RequestUriParam {
            name: name.into(),
            reference: None,
            value: Some(value.into()),
        });
        self
    }

    pub fn with_reference_param(
        mut self,
        name: impl Into<String>,
        reference: impl Into<String>,
    ) -> Self {
        self.request_uri_params.push(RequestUriParam {
            name: name.into(),
            reference: Some(reference.into()),
            value: None,
        });
        self
    }
}

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// A named telemetry reporting configuration
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    /// Content hash used for external change detection
    pub hash: String,
    pub protocol: Protocol,
    pub encoding: EncodingType,
    pub json_format: JsonFormat,
    /// Zero means the profile never recurs
    pub reporting_interval: Duration,
    /// Zero means no activation deadline
    pub activation_timeout: Duration,
    /// Generate a report as soon as the profile is enabled
    pub generate_now: bool,
    pub params: Vec<Param>,
    pub static_params: Vec<StaticParam>,
    pub event_markers: Vec<EventMarker>,
    pub grep_markers: Vec<GrepMarker>,
    pub http: Option<HttpDestination>,
}

impl Profile {
    /// A JSON/HTTP profile with no data sources
    pub fn new(name: impl Into<String>, reporting_interval: Duration) -> Self {
        let name = name.into();
        Self {
            hash: format!("{:016x}", xxh3_64(name.as_bytes())),
            name,
            protocol: Protocol::Http,
            encoding: EncodingType::Json,
            json_format: JsonFormat::NameValuePair,
            reporting_interval,
            activation_timeout: Duration::ZERO,
            generate_now: false,
            params: Vec::new(),
            static_params: Vec::new(),
            event_markers: Vec::new(),
            grep_markers: Vec::new(),
            http: None,
        }
    }

    pub fn with_activation_timeout(mut self, timeout: Duration) -> Self {
        self.activation_timeout = timeout;
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingType) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_json_format(mut self, format: JsonFormat) -> Self {
        self.json_format = format;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_static_param(mut self, param: StaticParam) -> Self {
        self.static_params.push(param);
        self
    }

    pub fn with_event_marker(mut self, marker: EventMarker) -> Self {
        self.event_markers.push(marker);
        self
    }

    pub fn with_grep_marker(mut self, marker: GrepMarker) -> Self {
        self.grep_markers.push(marker);
        self
    }

    pub fn with_http(mut self, destination: HttpDestination) -> Self {
        self.http = Some(destination);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    /// Parse a JSON profile definition.
    ///
    /// Without an explicit `Hash` the content hash is the xxh3 of the raw text.
    pub fn from_json(raw: &str) -> ProfileResult<Self> {
        let definition: ProfileDefinition = serde_json::from_str(raw)
            .map_err(|e| ProfileError::invalid_definition("<unnamed>", e.to_string()))?;
        let hash = definition
            .hash
            .clone()
            .unwrap_or_else(|| format!("{:016x}", xxh3_64(raw.as_bytes())));
        definition.into_profile(hash)
    }
}

// ----------------------------------------------------------------------------
// Definition Format
// ----------------------------------------------------------------------------

/// Serialized form of a profile, as delivered by configuration management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDefinition {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Hash", default)]
    pub hash: Option<String>,
    #[serde(rename = "Protocol", default = "default_protocol")]
    pub protocol: String,
    #[serde(rename = "EncodingType", default = "default_encoding")]
    pub encoding_type: String,
    /// Seconds
    #[serde(rename = "ReportingInterval", default)]
    pub reporting_interval: u64,
    /// Seconds
    #[serde(rename = "ActivationTimeOut", default)]
    pub activation_timeout: u64,
    #[serde(rename = "GenerateNow", default)]
    pub generate_now: bool,
    #[serde(rename = "JSONEncoding", default)]
    pub json_encoding: JsonEncodingDefinition,
    #[serde(rename = "Parameter", default)]
    pub parameters: Vec<ParameterDefinition>,
    #[serde(rename = "HTTP", default)]
    pub http: Option<HttpDefinition>,
}

fn default_protocol() -> String {
    "HTTP".into()
}

fn default_encoding() -> String {
    "JSON".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEncodingDefinition {
    #[serde(rename = "ReportFormat", default = "default_report_format")]
    pub report_format: String,
}

impl Default for JsonEncodingDefinition {
    fn default() -> Self {
        Self {
            report_format: default_report_format(),
        }
    }
}

fn default_report_format() -> String {
    "NameValuePair".into()
}

/// One entry of the `Parameter` list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParameterDefinition {
    #[serde(rename = "dataModel")]
    DataModel {
        reference: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(rename = "reportEmpty", default)]
        report_empty: bool,
    },
    #[serde(rename = "static")]
    Static { name: String, value: String },
    #[serde(rename = "event")]
    Event {
        #[serde(rename = "eventName")]
        event_name: String,
        component: String,
        #[serde(rename = "use", default)]
        kind: MarkerKind,
        #[serde(default)]
        name: Option<String>,
        #[serde(rename = "reportEmpty", default)]
        report_empty: bool,
        #[serde(rename = "reportTimestamp", default)]
        report_timestamp: Option<String>,
        #[serde(rename = "skipFrequency", default)]
        skip_frequency: u32,
    },
    #[serde(rename = "grep")]
    Grep {
        marker: String,
        search: String,
        #[serde(rename = "logFile")]
        log_file: String,
        #[serde(rename = "use", default)]
        kind: MarkerKind,
        #[serde(rename = "reportEmpty", default)]
        report_empty: bool,
        #[serde(rename = "skipFrequency", default)]
        skip_frequency: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpDefinition {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "RequestURIParameter", default)]
    pub request_uri_params: Vec<RequestUriParam>,
}

impl ProfileDefinition {
    /// Build the runtime profile
    pub fn into_profile(self, hash: String) -> ProfileResult<Profile> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ProfileError::invalid_definition("<unnamed>", "profile name is empty"));
        }

        let mut profile = Profile::new(name.clone(), Duration::from_secs(self.reporting_interval))
            .with_activation_timeout(Duration::from_secs(self.activation_timeout))
            .with_protocol(Protocol::parse(&self.protocol))
            .with_encoding(EncodingType::parse(&self.encoding_type))
            .with_json_format(JsonFormat::parse(&self.json_encoding.report_format))
            .with_hash(hash);
        profile.generate_now = self.generate_now;

        for parameter in self.parameters {
            match parameter {
                ParameterDefinition::DataModel {
                    reference,
                    name: alias,
                    report_empty,
                } => {
                    if reference.is_empty() {
                        return Err(ProfileError::invalid_definition(
                            &name,
                            "dataModel parameter without reference",
                        ));
                    }
                    profile.params.push(Param {
                        reference,
                        alias,
                        report_empty,
                    });
                }
                ParameterDefinition::Static { name: key, value } => {
                    profile.static_params.push(StaticParam::new(key, value));
                }
                ParameterDefinition::Event {
                    event_name,
                    component,
                    kind,
                    name: alias,
                    report_empty,
                    report_timestamp,
                    skip_frequency,
                } => {
                    if profile.event_markers.iter().any(|m| m.name == event_name) {
                        return Err(ProfileError::invalid_definition(
                            &name,
                            format!("duplicate event marker '{}'", event_name),
                        ));
                    }
                    let timestamps = report_timestamp
                        .as_deref()
                        .map(|ts| ts.eq_ignore_ascii_case("Unix-Epoch"))
                        .unwrap_or(false);
                    let mut marker = EventMarker::new(event_name, component, kind)
                        .with_report_empty(report_empty)
                        .with_timestamps(timestamps)
                        .with_skip_frequency(skip_frequency);
                    marker.alias = alias;
                    profile.event_markers.push(marker);
                }
                ParameterDefinition::Grep {
                    marker,
                    search,
                    log_file,
                    kind,
                    report_empty,
                    skip_frequency,
                } => {
                    if search.is_empty() {
                        return Err(ProfileError::invalid_definition(
                            &name,
                            format!("grep marker '{}' has an empty search string", marker),
                        ));
                    }
                    let mut grep = GrepMarker::new(marker, search, log_file, kind);
                    grep.report_empty = report_empty;
                    grep.skip_frequency = skip_frequency;
                    profile.grep_markers.push(grep);
                }
            }
        }

        if let Some(http) = self.http {
            profile.http = Some(HttpDestination {
                url: http.url,
                request_uri_params: http.request_uri_params,
            });
        }

        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const DEFINITION: &str = r#"{
        "Name": "RDKB_Profile",
        "Protocol": "HTTP",
        "EncodingType": "JSON",
        "ReportingInterval": 300,
        "ActivationTimeOut": 3600,
        "JSONEncoding": { "ReportFormat": "NameValuePair" },
        "Parameter": [
            { "type": "static", "name": "Profile", "value": "RDKB" },
            { "type": "dataModel", "name": "Model", "reference": "Device.DeviceInfo.ModelName" },
            { "type": "event", "eventName": "SYS_INFO_boot", "component": "sysint", "use": "accumulate", "reportTimestamp": "Unix-Epoch" },
            { "type": "grep", "marker": "SYS_ERROR_oom", "search": "Out of memory", "logFile": "messages.txt", "use": "count" }
        ],
        "HTTP": {
            "URL": "https://collector.example.net/report",
            "RequestURIParameter": [ { "Name": "deviceId", "Reference": "Device.DeviceInfo.SerialNumber" } ]
        }
    }"#;

    #[test]
    fn test_parse_full_definition() {
        let profile = Profile::from_json(DEFINITION).unwrap();

        assert_eq!(profile.name, "RDKB_Profile");
        assert_eq!(profile.reporting_interval, Duration::from_secs(300));
        assert_eq!(profile.activation_timeout, Duration::from_secs(3600));
        assert_eq!(profile.encoding, EncodingType::Json);
        assert_eq!(profile.json_format, JsonFormat::NameValuePair);
        assert_eq!(profile.static_params, vec![StaticParam::new("Profile", "RDKB")]);
        assert_eq!(profile.params[0].report_name(), "Model");
        assert_eq!(profile.event_markers[0].kind(), MarkerKind::Accumulate);
        assert!(profile.event_markers[0].report_timestamps);
        assert_eq!(profile.grep_markers[0].kind, MarkerKind::Counter);

        let http = profile.http.unwrap();
        assert_eq!(http.url, "https://collector.example.net/report");
        assert_eq!(http.request_uri_params[0].name, "deviceId");
    }

    #[test]
    fn test_hash_defaults_to_content_hash() {
        let first = Profile::from_json(DEFINITION).unwrap();
        let again = Profile::from_json(DEFINITION).unwrap();
        assert_eq!(first.hash, again.hash);

        let changed = DEFINITION.replace("300", "600");
        assert_ne!(Profile::from_json(&changed).unwrap().hash, first.hash);

        let explicit = Profile::from_json(r#"{"Name":"P","Hash":"h-1"}"#).unwrap();
        assert_eq!(explicit.hash, "h-1");
    }

    #[test]
    fn test_unsupported_values_survive_parsing() {
        let profile = Profile::from_json(
            r#"{"Name":"P","Protocol":"RBUS_METHOD","EncodingType":"XML",
                "JSONEncoding":{"ReportFormat":"ObjectHierarchy"}}"#,
        )
        .unwrap();
        assert_eq!(profile.protocol, Protocol::Other("RBUS_METHOD".into()));
        assert_eq!(profile.encoding, EncodingType::Other("XML".into()));
        assert_eq!(profile.json_format, JsonFormat::ObjectHierarchy);
    }

    #[rstest]
    #[case(r#"{"Name":"  "}"#)]
    #[case(r#"{"Name":"P","Parameter":[{"type":"grep","marker":"m","search":"","logFile":"x"}]}"#)]
    #[case(r#"{"Name":"P","Parameter":[
        {"type":"event","eventName":"E","component":"c"},
        {"type":"event","eventName":"E","component":"d"}]}"#)]
    #[case("not json")]
    fn test_invalid_definitions(#[case] raw: &str) {
        let err = Profile::from_json(raw).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidDefinition { .. }));
    }

    #[rstest]
    #[case("json", EncodingType::Json)]
    #[case("MessagePack", EncodingType::MessagePack)]
    #[case("XML", EncodingType::Other("XML".into()))]
    fn test_encoding_parse(#[case] raw: &str, #[case] expected: EncodingType) {
        assert_eq!(EncodingType::parse(raw), expected);
    }
}
