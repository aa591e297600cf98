//! Firmware image info command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    keyflash::HexImage,
    std::path::Path,
};

fn load_image(image: &Path) -> Result<HexImage> {
    HexImage::from_file(image)
        .with_context(|| format!("Failed to load firmware image {}", image.display()))
}

fn hex_addr(addr: Option<u32>) -> Option<String> {
    addr.map(|a| format!("0x{a:08X}"))
}

/// Info command implementation.
pub(crate) fn cmd_info(image: &Path, json: bool) -> Result<()> {
    if json {
        return cmd_info_json(image);
    }

    eprintln!(
        "{} Loading {}",
        style("📦").cyan(),
        image.display()
    );
    let hex = load_image(image)?;

    eprintln!(
        "\n{}",
        style("Firmware Image")
            .bold()
            .underlined()
    );
    eprintln!("  Format: Intel HEX");
    eprintln!("  Data: {} bytes", hex.data_len());
    eprintln!("  Segments: {}", hex.segments().len());
    if let (Some(base), Some(end)) = (hex.base_address(), hex.end_address()) {
        eprintln!("  Range: {base:08X}..{end:08X}");
    }
    if let Some(start) = hex.start_address() {
        eprintln!("  Entry point: {start:08X}");
    }

    for (i, segment) in hex
        .segments()
        .iter()
        .enumerate()
    {
        eprintln!(
            "  [{:2}] {} {} bytes",
            i,
            style(format!("{:08X}", segment.address)).cyan(),
            segment
                .data
                .len()
        );
    }

    Ok(())
}

/// Info command `--json` output: structured JSON to stdout.
fn cmd_info_json(image: &Path) -> Result<()> {
    let hex = load_image(image)?;

    let segments: Vec<serde_json::Value> = hex
        .segments()
        .iter()
        .map(|segment| {
            serde_json::json!({
                "address": format!("0x{:08X}", segment.address),
                "length": segment.data.len(),
            })
        })
        .collect();

    let info = serde_json::json!({
        "ok": true,
        "data": {
            "format": "ihex",
            "data_len": hex.data_len(),
            "base_address": hex_addr(hex.base_address()),
            "end_address": hex_addr(hex.end_address()),
            "start_address": hex_addr(hex.start_address()),
            "segments": segments,
        }
    });

    println!(
        "{}",
        serde_json::to_string_pretty(&info)?
    );
    Ok(())
}
