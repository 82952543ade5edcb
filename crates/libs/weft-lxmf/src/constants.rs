pub const APP_NAME: &str = "lxmf";
pub const DELIVERY_ASPECT: &str = "delivery";
pub const PROPAGATION_ASPECT: &str = "propagation";

pub const FIELD_EMBEDDED_LXMS: u8 = 0x01;
pub const FIELD_TELEMETRY: u8 = 0x02;
pub const FIELD_TELEMETRY_STREAM: u8 = 0x03;
pub const FIELD_ICON_APPEARANCE: u8 = 0x04;
pub const FIELD_FILE_ATTACHMENTS: u8 = 0x05;
pub const FIELD_IMAGE: u8 = 0x06;
pub const FIELD_AUDIO: u8 = 0x07;
pub const FIELD_THREAD: u8 = 0x08;
pub const FIELD_COMMANDS: u8 = 0x09;
pub const FIELD_RESULTS: u8 = 0x0A;
pub const FIELD_GROUP: u8 = 0x0B;
pub const FIELD_TICKET: u8 = 0x0C;
pub const FIELD_EVENT: u8 = 0x0D;
pub const FIELD_RNR_REFS: u8 = 0x0E;
pub const FIELD_RENDERER: u8 = 0x0F;

/// Field ids at or above this value are application defined.
pub const FIELD_USER_RANGE_START: u8 = 0xF0;

pub const RENDERER_PLAIN: u8 = 0x00;
pub const RENDERER_MICRON: u8 = 0x01;
pub const RENDERER_MARKDOWN: u8 = 0x02;
pub const RENDERER_BBCODE: u8 = 0x03;

pub const DESTINATION_LENGTH: usize = 16;
pub const SIGNATURE_LENGTH: usize = 64;

/// Delivery retry policy, aligned with reference peers.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const MAX_PATHLESS_TRIES: u32 = 1;
pub const DELIVERY_RETRY_WAIT_SECS: u64 = 10;
pub const PATH_REQUEST_WAIT_SECS: u64 = 7;
pub const STALE_PATH_WAIT_MILLIS: u64 = 500;
pub const PROCESSING_INTERVAL_SECS: u64 = 4;

pub const STAMP_COST_TARGET_DEFAULT: u8 = 8;

/// Workblock expansion: each round contributes 256 bytes of HKDF
/// output, ten rounds give the 2 560-byte search buffer.
pub const WORKBLOCK_EXPAND_ROUNDS: usize = 10;

pub const LXMF_MAX_SIZE: usize = 1024 * 1024;

/// Duplicate suppression window for inbound message ids.
pub const DEDUP_TTL_SECS: u64 = 300;
