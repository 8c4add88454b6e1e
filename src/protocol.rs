//! Shared protocol constants for the AirDrop wire format

/// DNS-SD service type browsed and published by every peer.
pub const SERVICE_TYPE: &str = "_airdrop._tcp.local.";

/// Fixed HTTPS port of the transfer server.
pub const PORT: u16 = 8770;

// TXT record flag bits
pub const FLAG_SUPPORTS_MIXED_TYPES: u32 = 0x08;
pub const FLAG_SUPPORTS_DISCOVER_MAYBE: u32 = 0x80;
pub const FLAGS: u32 = FLAG_SUPPORTS_MIXED_TYPES | FLAG_SUPPORTS_DISCOVER_MAYBE;
pub const TXT_FLAGS: &str = "flags";

/// Random device id length in bytes (hex encoded on the wire).
pub const ID_LEN: usize = 6;

pub const BUNDLE_ID: &str = "com.apple.finder";

/// Namespace under `Vendor` in the capability document.
pub const VENDOR_NAMESPACE: &str = "org.mokee";
pub const CAPABILITY_VERSION: i64 = 1;
pub const VENDOR_API_VERSION: i64 = 1;

pub const DEFAULT_MODEL_NAME: &str = "Android";

pub mod routes {
    pub const DISCOVER: &str = "/Discover";
    pub const ASK: &str = "/Ask";
    pub const UPLOAD: &str = "/Upload";
}

pub mod content_type {
    pub const PLIST: &str = "application/x-apple-binary-plist";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}

/// Plist dictionary keys. These must match exactly for interoperability.
pub mod keys {
    pub const SENDER_ID: &str = "SenderID";
    pub const SENDER_COMPUTER_NAME: &str = "SenderComputerName";
    pub const BUNDLE_ID: &str = "BundleID";
    pub const CONVERT_MEDIA_FORMATS: &str = "ConvertMediaFormats";
    pub const FILES: &str = "Files";
    pub const FILE_ICON: &str = "FileIcon";

    pub const FILE_NAME: &str = "FileName";
    pub const FILE_TYPE: &str = "FileType";
    pub const FILE_BOM_PATH: &str = "FileBomPath";
    pub const FILE_IS_DIRECTORY: &str = "FileIsDirectory";

    pub const RECEIVER_MODEL_NAME: &str = "ReceiverModelName";
    pub const RECEIVER_COMPUTER_NAME: &str = "ReceiverComputerName";
    pub const RECEIVER_MEDIA_CAPABILITIES: &str = "ReceiverMediaCapabilities";
}

/// Pipe and body limits
pub mod limits {
    /// Size of each chunk moved through an archive pipe.
    pub const CHUNK_SIZE: usize = 64 * 1024;
    /// Chunks in flight between packer and uploader (backpressure bound).
    pub const PIPE_CHUNKS: usize = 16;
    /// Upper bound for a plist control body.
    pub const MAX_CONTROL_BODY: usize = 8 * 1024 * 1024;
    /// Minimum spacing between forwarded progress reports.
    pub const PROGRESS_INTERVAL_MS: u64 = 100;
}

/// Network timeouts and delays (milliseconds)
pub mod timeouts {
    /// TCP connect timeout for outbound calls
    pub const CONNECT_MS: u64 = 10_000;
    /// TLS handshake timeout (both directions)
    pub const HANDSHAKE_MS: u64 = 10_000;
    /// How long an ask waits for its thumbnail before going without it
    pub const THUMBNAIL_MS: u64 = 2_000;
    /// Time an ask may wait for the user to answer before the peer gives up
    pub const ASK_RESPONSE_MS: u64 = 120_000;
}
