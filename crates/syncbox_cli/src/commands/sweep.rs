//! Sweep command implementation.

use std::path::Path;
use std::time::Duration;
use syncbox_codec::AssetStager;

/// Runs the sweep command.
pub fn run(dir: Option<&Path>, max_age_hours: u64) -> Result<(), Box<dyn std::error::Error>> {
    let stager = match dir {
        Some(dir) => AssetStager::new(dir)?,
        None => AssetStager::in_temp_dir()?,
    };
    let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));

    println!("Sweeping staged assets in {:?}", stager.dir());
    let removed = stager.sweep(max_age)?;
    println!("✓ Removed {} files older than {} hours", removed, max_age_hours);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let stager = AssetStager::new(dir.path()).unwrap();
        let asset = stager.stage(b"payload").unwrap();

        run(Some(dir.path()), 24).unwrap();
        assert!(asset.path().exists());

        run(Some(dir.path()), 0).unwrap();
        assert!(!asset.path().exists());
    }
}
