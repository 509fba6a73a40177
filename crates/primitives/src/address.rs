//! Destination addresses.
//!
//! Addresses are opaque strings; index keys use their sha256 so every key has
//! a fixed width.

use ledgerd_params::constants::MAX_ADDRESS_LEN;

use crate::hash::sha256;

pub type AddressKey = [u8; 32];

pub fn address_key(address: &str) -> AddressKey {
    sha256(address.as_bytes())
}

pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty()
        && address.len() <= MAX_ADDRESS_LEN
        && !address.chars().any(|c| c.is_whitespace() || c.is_control())
}
