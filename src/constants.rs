//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &[u8; 8] = b"-GT0000-";

/// Size of a chunk request within a piece (16 KiB).
pub const CHUNK_SIZE: u32 = 0x4000;

/// Largest peer-wire frame we will accept before dropping the connection.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Outstanding-request allowance assumed for a peer until it tells us otherwise.
pub const DEFAULT_PEER_MAX_REQUESTS: usize = 250;

/// Hard cap on outstanding requests per connection, whatever the peer allows.
pub const DEFAULT_REQUEST_CAP: usize = 64;

/// Most requests we will queue from a single peer.
pub const MAX_PEER_REQUESTS: usize = 250;

/// Concurrent outbound dials in progress.
pub const DEFAULT_HALF_OPEN_LIMIT: usize = 10;

/// Idle interval after which a keepalive is written.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// How long a DHT transaction waits for its response.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Nodes returned by find_node / get_peers handlers.
pub const DHT_K: usize = 8;

/// Good-node population at which bootstrap stops.
pub const DHT_BOOTSTRAP_TARGET: usize = 160;

/// Per-round wait during bootstrap before re-checking the table.
pub const DHT_BOOTSTRAP_ROUND: Duration = Duration::from_secs(15);

/// Seed node inserted when bootstrapping from an empty table.
pub const DHT_BOOTSTRAP_NODE: &str = "router.bittorrent.com:6881";

/// A node is good if heard from within this window, among other conditions.
pub const DHT_GOOD_WINDOW: Duration = Duration::from_secs(60);
