use chrono::Local;
use std::fmt::{Display, LowerHex};
use std::io::Write;
use std::sync::Once;

static INIT_LOGGER_ONCE: Once = Once::new();

pub fn init() {
    INIT_LOGGER_ONCE.call_once(|| {
        dotenv::dotenv().ok();

        env_logger::builder()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {:<5} {}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.module_path().unwrap(),
                    record.args()
                )
            })
            .init();
    })
}

pub fn fmt_hex32<T>(d: &T, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error>
where
    T: Display + LowerHex,
{
    write!(f, "0x{:08x}({})", d, d)
}

pub fn fmt_hex64<T>(d: &T, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error>
where
    T: Display + LowerHex,
{
    write!(f, "0x{:016x}({})", d, d)
}

/// Field payloads inside a redo record are 4-byte aligned.
pub fn align4(num: usize) -> usize {
    (num + 3) & !3
}

/// Redo fields are little-endian on the wire; byte-order conversion is
/// centralised here so record parsers only ever deal in offsets.
pub fn read16(buf: &[u8], addr: usize) -> u16 {
    u16::from_le_bytes(buf[addr..addr + 2].try_into().expect("ERR_READ_VALUE_u16"))
}

pub fn read32(buf: &[u8], addr: usize) -> u32 {
    u32::from_le_bytes(buf[addr..addr + 4].try_into().expect("ERR_READ_VALUE_u32"))
}

pub fn read48(buf: &[u8], addr: usize) -> u64 {
    let b = &buf[addr..addr + 6];
    let arr = [b[0], b[1], b[2], b[3], b[4], b[5], 0u8, 0u8];
    u64::from_le_bytes(arr)
}

pub fn read56(buf: &[u8], addr: usize) -> u64 {
    let b = &buf[addr..addr + 7];
    let arr = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], 0u8];
    u64::from_le_bytes(arr)
}

pub fn read64(buf: &[u8], addr: usize) -> u64 {
    u64::from_le_bytes(buf[addr..addr + 8].try_into().expect("ERR_READ_VALUE_u64"))
}

pub fn write16(buf: &mut [u8], addr: usize, val: u16) {
    buf[addr..addr + 2].copy_from_slice(&val.to_le_bytes());
}

pub fn write32(buf: &mut [u8], addr: usize, val: u32) {
    buf[addr..addr + 4].copy_from_slice(&val.to_le_bytes());
}

pub fn write64(buf: &mut [u8], addr: usize, val: u64) {
    buf[addr..addr + 8].copy_from_slice(&val.to_le_bytes());
}
