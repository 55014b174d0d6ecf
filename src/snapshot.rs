use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::env::Environment;

/// Default file the evaluator writes when the agent advances to the next stage.
pub const NEXT_ROUND_STATE: &str = "next_game_round.state";

pub fn save_game_state<E: Environment + ?Sized, P: AsRef<Path>>(env: &E, path: P) -> Result<()> {
    let content = env.emulator_state()?;
    write_compressed(&content, path.as_ref())
}

pub fn write_compressed(content: &[u8], path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create state file: {}", path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(content)?;
    encoder.finish()?.flush()?;
    Ok(())
}

pub fn load_game_state<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let file = File::open(path.as_ref())?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut content = Vec::new();
    decoder.read_to_end(&mut content)?;
    Ok(content)
}
