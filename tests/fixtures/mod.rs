//! Stand-in worker scripts and request payloads
//!
//! Each script is run as `sh -c <script> worker <job args...>`, so `$@` is
//! exactly the worker contract (`--image_a A --image_b B --aoi S --out_dir D`)
//! and the last argument is the job's output directory.

#![allow(dead_code)]

use serde_json::{json, Value};

/// Writes both expected artifacts and exits 0.
pub const SUCCESS_WORKER: &str = r#"for out; do :; done
echo "clipping to $6"
printf 'A' > "$out/A_clipped.tif"
printf 'B' > "$out/B_clipped_aligned.tif""#;

/// Reports a bad AOI on stderr and exits 1.
pub const FAILING_WORKER: &str = r#"echo 'bad AOI' >&2
exit 1"#;

/// Blocks until a `release` file appears in its output directory, then fails.
pub const BLOCKING_WORKER: &str = r#"for out; do :; done
while [ ! -e "$out/release" ]; do sleep 0.05; done
exit 1"#;

/// Little-endian TIFF header, enough for format sniffing.
pub const TIFF_BYTES: &[u8] = &[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];

pub fn scenario_aoi() -> Value {
    json!({"north": 20.5, "south": 19.5, "east": 79.5, "west": 78.5})
}

pub fn create_request() -> Value {
    json!({
        "imageARef": "img-a",
        "imageBRef": "img-b",
        "aoi": scenario_aoi(),
    })
}
