//! ITCH 5.0 wire builders shared by the integration tests.

#![allow(dead_code)]

/// Wrap a message in its frame: 2-byte big-endian length that counts
/// itself, then the message bytes.
pub fn frame(message: &[u8]) -> Vec<u8> {
    let length = (message.len() + 2) as u16;
    let mut out = length.to_be_bytes().to_vec();
    out.extend_from_slice(message);
    out
}

/// Common message header: locate, tracking, timestamp, type byte.
pub fn header(locate: u16, tracking: u16, timestamp: u64, kind: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.extend_from_slice(&locate.to_be_bytes());
    out.extend_from_slice(&tracking.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.push(kind);
    out
}

pub fn pad_symbol(symbol: &str) -> [u8; 8] {
    let mut padded = [b' '; 8];
    padded[..symbol.len()].copy_from_slice(symbol.as_bytes());
    padded
}

pub fn system_event(locate: u16, tracking: u16, timestamp: u64, event_code: u8) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'S');
    msg.push(event_code);
    frame(&msg)
}

pub fn stock_directory(locate: u16, tracking: u16, timestamp: u64, symbol: &str) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'R');
    msg.extend_from_slice(&pad_symbol(symbol));
    // Category, status, lot size and the other directory attributes are
    // irrelevant to the decoder; zero-fill to size.
    msg.resize(41, 0);
    frame(&msg)
}

#[allow(clippy::too_many_arguments)]
pub fn add_order(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    side: u8,
    shares: u32,
    symbol: &str,
    price: u32,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'A');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    msg.push(side);
    msg.extend_from_slice(&shares.to_be_bytes());
    msg.extend_from_slice(&pad_symbol(symbol));
    msg.extend_from_slice(&price.to_be_bytes());
    frame(&msg)
}

#[allow(clippy::too_many_arguments)]
pub fn add_order_mpid(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    side: u8,
    shares: u32,
    symbol: &str,
    price: u32,
    mpid: &[u8; 4],
) -> Vec<u8> {
    let mut framed = add_order(locate, tracking, timestamp, order_ref, side, shares, symbol, price);
    // Extend the body with the attribution and fix the length prefix.
    framed.extend_from_slice(mpid);
    let length = (framed.len()) as u16;
    framed[..2].copy_from_slice(&length.to_be_bytes());
    framed
}

pub fn order_executed(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    executed: u32,
    match_number: u64,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'E');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    msg.extend_from_slice(&executed.to_be_bytes());
    msg.extend_from_slice(&match_number.to_be_bytes());
    frame(&msg)
}

#[allow(clippy::too_many_arguments)]
pub fn order_executed_with_price(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    executed: u32,
    match_number: u64,
    printable: u8,
    price: u32,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'C');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    msg.extend_from_slice(&executed.to_be_bytes());
    msg.extend_from_slice(&match_number.to_be_bytes());
    msg.push(printable);
    msg.extend_from_slice(&price.to_be_bytes());
    frame(&msg)
}

pub fn order_cancel(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    cancelled: u32,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'X');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    msg.extend_from_slice(&cancelled.to_be_bytes());
    frame(&msg)
}

pub fn order_delete(locate: u16, tracking: u16, timestamp: u64, order_ref: u64) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'D');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    frame(&msg)
}

pub fn order_replace(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    original_ref: u64,
    new_ref: u64,
    shares: u32,
    price: u32,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'U');
    msg.extend_from_slice(&original_ref.to_be_bytes());
    msg.extend_from_slice(&new_ref.to_be_bytes());
    msg.extend_from_slice(&shares.to_be_bytes());
    msg.extend_from_slice(&price.to_be_bytes());
    frame(&msg)
}

#[allow(clippy::too_many_arguments)]
pub fn trade(
    locate: u16,
    tracking: u16,
    timestamp: u64,
    order_ref: u64,
    side: u8,
    shares: u32,
    symbol: &str,
    price: u32,
    match_number: u64,
) -> Vec<u8> {
    let mut msg = header(locate, tracking, timestamp, b'P');
    msg.extend_from_slice(&order_ref.to_be_bytes());
    msg.push(side);
    msg.extend_from_slice(&shares.to_be_bytes());
    msg.extend_from_slice(&pad_symbol(symbol));
    msg.extend_from_slice(&price.to_be_bytes());
    msg.extend_from_slice(&match_number.to_be_bytes());
    frame(&msg)
}

/// Concatenate frames into one packet payload.
pub fn packet(frames: &[Vec<u8>]) -> Vec<u8> {
    frames.iter().flatten().copied().collect()
}
