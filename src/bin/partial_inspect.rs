use anyhow::Context;
use serde::Serialize;
use transfer_core::download::{LoadedMetSource, store};
use transfer_core::transfer::progress_percent;

fn usage() -> &'static str {
    "Usage: cargo run --bin partial_inspect -- <incomplete_dir> [--json] [--hash]"
}

#[derive(Serialize)]
struct PartialReport {
    part: String,
    file_name: String,
    content_urn: String,
    size: Option<u64>,
    acquired: u64,
    progress: u8,
    state: String,
    on_disk: Option<u64>,
    from_backup: bool,
    /// Only filled with `--hash` on complete partials.
    hash_matches: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let dir = args.next().ok_or_else(|| anyhow::anyhow!(usage()))?;
    let flags: Vec<String> = args.collect();
    let json = flags.iter().any(|f| f == "--json");
    let hash = flags.iter().any(|f| f == "--hash");

    let recovered = store::scan_recoverable_downloads(std::path::Path::new(&dir))
        .await
        .with_context(|| format!("failed to scan {dir}"))?;

    let mut reports = Vec::with_capacity(recovered.len());
    for r in recovered {
        let on_disk = tokio::fs::metadata(&r.part_path).await.ok().map(|m| m.len());
        let acquired = r.met.acquired.covered();
        let complete = r.met.file_size.is_some_and(|s| r.met.acquired.is_complete(s));
        let hash_matches = if hash && complete {
            let actual = transfer_core::download::hash::hash_file(&r.part_path)
                .await
                .with_context(|| format!("failed to hash {}", r.part_path.display()))?;
            Some(actual == r.met.content_id)
        } else {
            None
        };
        reports.push(PartialReport {
            part: r.part_path.display().to_string(),
            file_name: r.met.file_name.clone(),
            content_urn: r.met.content_id.to_urn(),
            size: r.met.file_size,
            acquired,
            progress: progress_percent(acquired, r.met.file_size.unwrap_or(0)),
            state: format!("{:?}", r.met.state).to_lowercase(),
            on_disk,
            from_backup: r.source == LoadedMetSource::Backup,
            hash_matches,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("partials: {}", reports.len());
    for r in &reports {
        let size = r.size.map_or_else(|| "?".to_string(), |s| s.to_string());
        println!(
            "  {:>3}% {:>12}/{:<12} {:<11} {}{}",
            r.progress,
            r.acquired,
            size,
            r.state,
            r.file_name,
            if r.from_backup { " (backup)" } else { "" }
        );
        if let Some(ok) = r.hash_matches {
            println!("       hash {}", if ok { "ok" } else { "MISMATCH" });
        }
    }

    Ok(())
}
