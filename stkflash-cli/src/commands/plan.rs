//! Page plan command implementation.

use {
    crate::Settings,
    anyhow::Result,
    console::style,
    std::path::Path,
    stkflash::{MemoryImage, Page},
};

/// Print how `image` will be laid out in flash, without connecting.
pub(crate) fn cmd_plan(
    path: &Path,
    image: &MemoryImage,
    pages: &[Page],
    settings: &Settings,
    json: bool,
) -> Result<()> {
    if json {
        return cmd_plan_json(path, image, pages, settings);
    }

    let device = settings.flash.device;
    println!(
        "{} {}",
        style("Image:").bold(),
        style(path.display()).cyan()
    );
    println!(
        "  {} bytes in {} segment(s)",
        image.len(),
        image.segments().len()
    );
    for segment in image.segments() {
        println!(
            "    {} 0x{:05X}..0x{:05X} ({} bytes)",
            style("•").dim(),
            segment.start,
            segment.end,
            segment.end - segment.start
        );
    }

    println!(
        "{} {} ({} byte pages, {} bytes flash)",
        style("Device:").bold(),
        device,
        settings.flash.page_size,
        device.flash_size()
    );

    println!("{} {}", style("Pages:").bold(), pages.len());
    for page in pages {
        let used = image
            .range(page.base_address()..)
            .take_while(|&(address, _)| u64::from(address) < page.end_address())
            .count();
        println!(
            "    {} 0x{:05X} {:>4}/{} bytes from image",
            style("•").dim(),
            page.base_address(),
            used,
            page.len()
        );
    }

    Ok(())
}

fn cmd_plan_json(
    path: &Path,
    image: &MemoryImage,
    pages: &[Page],
    settings: &Settings,
) -> Result<()> {
    let segments: Vec<serde_json::Value> = image
        .segments()
        .iter()
        .map(|s| {
            serde_json::json!({
                "start": s.start,
                "end": s.end,
                "len": s.end - s.start,
            })
        })
        .collect();
    let pages: Vec<serde_json::Value> = pages
        .iter()
        .map(|p| {
            serde_json::json!({
                "address": p.base_address(),
                "len": p.len(),
            })
        })
        .collect();

    let output = serde_json::json!({
        "ok": true,
        "data": {
            "image": path.display().to_string(),
            "bytes": image.len(),
            "device": settings.flash.device,
            "page_size": settings.flash.page_size,
            "segments": segments,
            "pages": pages,
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
