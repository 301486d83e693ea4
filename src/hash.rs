//! The two hash functions that route a query name onto the storage grid.
//!
//! Both are table-driven CRC32 over distinct reversed polynomials, so the
//! backend index and the per-backend channel index of a name are
//! statistically independent: one hot backend shard doesn't collapse onto a
//! single worker.

/// Reversed polynomial for [`backend_hash`]. The standard IEEE polynomial,
/// so values match `zlib.crc32`.
const BACKEND_POLY: u32 = 0xEDB8_8320;

/// Reversed polynomial for [`channel_hash`].
const CHANNEL_POLY: u32 = 0xD582_8281;

lazy_static! {
    static ref BACKEND_TABLE: [u32; 256] = make_table(BACKEND_POLY);
    static ref CHANNEL_TABLE: [u32; 256] = make_table(CHANNEL_POLY);
}

fn make_table(poly: u32) -> [u32; 256] {
    let mut table = [0_u32; 256];

    for (i, entry) in table.iter_mut().enumerate() {
        let mut crc = i as u32;
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
        *entry = crc;
    }

    table
}

fn checksum(table: &[u32; 256], data: &[u8]) -> u32 {
    let mut crc = !0_u32;

    for &b in data {
        crc = table[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }

    !crc
}

/// Hashes a query name to pick its backend shard.
pub fn backend_hash(data: &[u8]) -> u32 {
    checksum(&BACKEND_TABLE, data)
}

/// Hashes a query name to pick its channel (and so its worker) within the
/// backend shard.
pub fn channel_hash(data: &[u8]) -> u32 {
    checksum(&CHANNEL_TABLE, data)
}
