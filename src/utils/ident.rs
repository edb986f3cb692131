use rand::Rng;

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of receiver and transfer identifiers.
pub const ID_LEN: usize = 12;

/// Random 12-character lowercase alphanumeric identifier.
///
/// Each character is drawn independently from the 36-letter alphabet using
/// the thread-local CSPRNG, so collisions are negligible for any realistic
/// number of connected peers.
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ALPHABET[rng.gen::<usize>() % ALPHABET.len()] as char)
        .collect()
}
