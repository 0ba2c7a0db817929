use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field '{field}'.")]
    MissingField { field: &'static str },
    #[error("Field '{field}' must not be empty.")]
    EmptyField { field: &'static str },
    #[error("Invalid boolean '{value}' for '{field}'. Expected true/false, yes/no, on/off, or 1/0.")]
    InvalidBoolean { field: String, value: String },
    #[error("Invalid number '{value}' for '{field}'.")]
    InvalidNumber { field: String, value: String },
    #[error("Invalid port '{value}'. Expected 1-65535.")]
    InvalidPort { value: String },
    #[error("Invalid bind address '{value}'.")]
    InvalidBindAddress { value: String },
    #[error("Invalid protocol '{value}'. Use 'tcp' or 'udp'.")]
    InvalidProtocol { value: String },
    #[error("Invalid test mode '{value}'. Use bidir, up_only, down_only, dual, or two_phase.")]
    InvalidMode { value: String },
    #[error("Invalid bitrate '{value}' (expected e.g. 100M, 1G, 500k).")]
    InvalidBitrate { value: String },
    #[error("Value must be >= {min}.")]
    ValueTooSmall { min: u64 },
    #[error("UDP sessions cannot be bidirectional.")]
    UdpBidirectional,
    #[error("UDP sessions require parallel = 1 (got {parallel}).")]
    UdpParallel { parallel: u32 },
    #[error("Client '{client}': {source}")]
    Client {
        client: String,
        #[source]
        source: Box<ValidationError>,
    },
    #[error("Test plan needs at least one client.")]
    NoClients,
    #[error("Invalid agent URL '{value}'.")]
    InvalidAgentUrl { value: String },
    #[error("Port range {first}-{last} must stay within 1024-65535.")]
    PortRangeOutOfBounds { first: u32, last: u32 },
    #[error("Duration must be > 0.")]
    DurationZero,
    #[error("Two-phase runs need a duration of at least 2 seconds (got {duration_sec}).")]
    TwoPhaseTooShort { duration_sec: u64 },
    #[error("Poll interval must be >= {min_ms}ms.")]
    PollIntervalTooSmall { min_ms: u64 },
    #[error("Request body is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("Request body must be a JSON object.")]
    ExpectedObject,
    #[error("Invalid duration '{value}'. Use a number with an optional ms/s/m/h suffix.")]
    InvalidDuration { value: String },
}

impl ValidationError {
    pub(crate) fn for_client(client: impl Into<String>, source: Self) -> Self {
        Self::Client {
            client: client.into(),
            source: Box::new(source),
        }
    }
}
