use norkv::{
    FileFlash, FlashDevice, RecordHeader, SwapHeader, MAX_VALUE_LENGTH, RECORD_HEADER_SIZE,
    SWAP_HEADER_SIZE,
};
use std::env;
use std::error::Error;
use std::process;

fn main() -> Result<(), Box<dyn Error>> {
    let Some(dir) = env::args().nth(1) else {
        eprintln!("usage: flash_dump <image-dir>");
        process::exit(2);
    };

    let flash = FileFlash::open(&dir)?;
    for region in 0..2u8 {
        let mut marker = [0u8; SWAP_HEADER_SIZE as usize];
        flash.read(region, 0, &mut marker)?;
        let header = SwapHeader::decode(marker);
        let state = if header.is_active() {
            "active"
        } else if header.is_inactive() {
            "inactive"
        } else {
            "blank"
        };
        println!("region {region}: {state}");
        if header.is_active() {
            dump_region(&flash, region)?;
        }
    }
    Ok(())
}

fn dump_region(flash: &FileFlash, region: u8) -> Result<(), Box<dyn Error>> {
    let swap_size = flash.swap_size();
    if swap_size < SWAP_HEADER_SIZE + RECORD_HEADER_SIZE {
        return Ok(());
    }
    let mut offset = SWAP_HEADER_SIZE;
    while offset <= swap_size - RECORD_HEADER_SIZE {
        let mut bytes = [0u8; RECORD_HEADER_SIZE as usize];
        flash.read(region, offset, &mut bytes)?;
        let header = RecordHeader::decode(bytes);
        if !header.write_started() {
            break;
        }
        let state = if !header.committed() {
            "uncommitted"
        } else if header.deleted() {
            "deleted"
        } else {
            "live"
        };
        println!(
            "  {offset:>8}  key={:#06x}  len={:>3}  first={}  {state}",
            header.key(),
            header.length(),
            header.first()
        );
        if header.length() > MAX_VALUE_LENGTH || offset + header.total_size() > swap_size {
            println!("  {offset:>8}  (corrupt record header, stopping)");
            break;
        }
        offset += header.total_size();
    }
    Ok(())
}
