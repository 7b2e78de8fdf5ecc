//! Shared protocol constants for the fleetsync framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FSNC";
pub const VERSION: u16 = 1;

// Maximum frame payload size (64MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// Archive chunk size used when streaming bundles to a peer (1MB)
pub const ARCHIVE_CHUNK_SIZE: usize = 1024 * 1024;

// Name of the manifest carried inside every archive bundle
pub const MANIFEST_NAME: &str = "cluster_control.json";

// Frame type IDs (keep numeric stable)
pub mod frame {
    // Worker introduces itself: payload is a bincode Hello
    pub const HELLO: u8 = 1;
    pub const HELLO_ACK: u8 = 2;
    // Request/response pair, correlated by id
    pub const REQUEST: u8 = 3;
    pub const RESPONSE: u8 = 4;
    // Archive streaming: DATA frames carry (name, chunk), END closes the named archive
    pub const ARCHIVE_DATA: u8 = 5;
    pub const ARCHIVE_END: u8 = 6;
}

// Commands understood on worker connections
pub mod command {
    // worker -> master
    pub const ECHO: &str = "echo";
    pub const REQUEST_SYNC: &str = "request_sync";
    pub const STREAM_SYNC: &str = "stream_sync";
    pub const LIST_NODES: &str = "list_nodes";

    // master -> worker
    pub const SYNC_OK: &str = "sync_ok";
    pub const SYNC_ERROR: &str = "sync_error";
    pub const PUSH_CORRECTIVE: &str = "push_corrective";
    pub const FILE_STATUS: &str = "file_status";
}

// Reply status tokens. A reply is "<status> <payload>".
pub mod status {
    pub const OK: &str = "ok";
    pub const ACK: &str = "ack";
    pub const ERR: &str = "err";
    // Reply to a worker echo
    pub const OK_CLIENT: &str = "ok-c";
    // Prefix of master-specific success markers
    pub const MASTER_PREFIX: &str = "ok-";
}

// Centralized timeout constants
pub mod timeouts {
    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Base timeout for reads (ms)
    pub const READ_BASE_MS: u64 = 300;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Time a new connection has to send HELLO (ms)
    pub const HELLO_MS: u64 = 2_000;

    // Default wait for a peer reply (ms)
    pub const REQUEST_MS: u64 = 30_000;

    // Transfer session chunk poll interval (ms)
    pub const TRANSFER_POLL_MS: u64 = 100;

    // How long chunks of an archive nobody claimed are kept (ms)
    pub const UNCLAIMED_ARCHIVE_MS: u64 = 30_000;

    // Pause after a failed accept() before retrying (ms)
    pub const ACCEPT_BACKOFF_MS: u64 = 100;

    // Calculate write deadline based on payload size (ms)
    // 500ms base + 1ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate read deadline based on payload size (ms)
    // 300ms base + 1ms per 1MB payload (ceil)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}
