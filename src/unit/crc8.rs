use crc::{Crc, CRC_8_NRSC_5};

// CRC-8/NRSC-5: polynomial 0x31, seed 0xFF, no reflection. The power units
// check it over each threshold byte in `adc hgrp` and `adc hlgrp` commands.
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Checksum of a single threshold byte as the hardware expects it.
pub fn threshold_crc(value: u8) -> u8 {
    crc8(&[value])
}
