//! The Data14 checksum carried by extended messages.

/// Compute the checksum an extended message carries in its last data byte:
/// the two's complement of the sum of Command1, Command2 and Data1..Data13,
/// truncated to one byte.
pub fn compute_checksum(cmd1: u8, cmd2: u8, data: &[u8]) -> u8 {
    let sum: u32 = cmd1 as u32
        + cmd2 as u32
        + data.iter().take(13).map(|b| *b as u32).sum::<u32>();
    ((0x100 - (sum & 0xFF)) & 0xFF) as u8
}

/// Verify a received Data14 against the payload it covers.
pub fn verify_checksum(cmd1: u8, cmd2: u8, data: &[u8], checksum: u8) -> bool {
    compute_checksum(cmd1, cmd2, data) == checksum
}
