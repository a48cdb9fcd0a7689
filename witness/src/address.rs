//! Conversion between XRPL classic addresses and EVM hex addresses.
//!
//! Both encode the same 20-byte account id. XRPL wraps it in base58check over the ripple alphabet with a zero
//! version byte; EVM renders it as `0x`-prefixed hex.

use crate::{chain::ChainType, error::AddressError};

const ACCOUNT_ID_LEN: usize = 20;
const ACCOUNT_VERSION: u8 = 0;

pub fn decode_xrpl(account: &str) -> Result<[u8; ACCOUNT_ID_LEN], AddressError> {
    let decoded = bs58::decode(account)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check(Some(ACCOUNT_VERSION))
        .into_vec()
        .map_err(|e| AddressError::Xrpl(account.to_owned(), e.to_string()))?;
    // The version byte is retained at the front of the decoded payload.
    let id = decoded
        .get(1..)
        .filter(|id| id.len() == ACCOUNT_ID_LEN)
        .ok_or_else(|| AddressError::Length(account.to_owned(), decoded.len().saturating_sub(1)))?;
    let mut out = [0u8; ACCOUNT_ID_LEN];
    out.copy_from_slice(id);
    Ok(out)
}

pub fn encode_xrpl(id: &[u8; ACCOUNT_ID_LEN]) -> String {
    bs58::encode(id)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check_version(ACCOUNT_VERSION)
        .into_string()
}

pub fn decode_evm(address: &str) -> Result<[u8; ACCOUNT_ID_LEN], AddressError> {
    let stripped = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    let bytes =
        hex::decode(stripped).map_err(|e| AddressError::Evm(address.to_owned(), e.to_string()))?;
    <[u8; ACCOUNT_ID_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| AddressError::Length(address.to_owned(), bytes.len()))
}

pub fn encode_evm(id: &[u8; ACCOUNT_ID_LEN]) -> String {
    format!("0x{}", hex::encode(id))
}

pub fn xrpl_to_evm(account: &str) -> Result<String, AddressError> {
    decode_xrpl(account).map(|id| encode_evm(&id))
}

pub fn evm_to_xrpl(address: &str) -> Result<String, AddressError> {
    decode_evm(address).map(|id| encode_xrpl(&id))
}

/// Whether `address` looks like an EVM hex address rather than an XRPL classic address.
pub fn is_evm(address: &str) -> bool {
    address.starts_with("0x") || address.starts_with("0X")
}

/// Render an address of either format in XRPL classic form.
pub fn to_xrpl(address: &str) -> Result<String, AddressError> {
    if is_evm(address) {
        evm_to_xrpl(address)
    } else {
        decode_xrpl(address)?;
        Ok(address.to_owned())
    }
}

/// Render an address of either format as lower-case EVM hex.
pub fn to_evm(address: &str) -> Result<String, AddressError> {
    if is_evm(address) {
        decode_evm(address).map(|id| encode_evm(&id))
    } else {
        xrpl_to_evm(address)
    }
}

/// Translate an account from the encoding of chain type `from` into that of chain type `to`.
pub fn translate(address: &str, from: ChainType, to: ChainType) -> Result<String, AddressError> {
    match (from, to) {
        (ChainType::Xrp, ChainType::Evm) => xrpl_to_evm(address),
        (ChainType::Evm, ChainType::Xrp) => evm_to_xrpl(address),
        _ => Ok(address.to_owned()),
    }
}

/// Compare `a`, encoded for `a_type`, with `b`, encoded for `b_type`. XRPL accounts compare exactly, EVM addresses
/// compare case-insensitively. An undecodable `b` never matches.
pub fn same_account(a: &str, a_type: ChainType, b: &str, b_type: ChainType) -> bool {
    let Ok(b) = translate(b, b_type, a_type) else {
        return false;
    };
    match a_type {
        ChainType::Xrp => a == b,
        ChainType::Evm => a.eq_ignore_ascii_case(&b),
    }
}
