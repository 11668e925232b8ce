//! Line interpreter over one dedupe class.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use gdedupe_core::{
    ClassOps, DedupeClass, DedupeConfig, DedupeError, FileProvider, MemProvider, Provider,
    ProviderRegistry,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

const SECTOR: u32 = 512;

const HELP: &str = "\
provider mem <name> <size>
provider file <name> <path> <size>
create <name> <provider>
destroy <name> [--force]
wipe <name>
configure <name> <key=value>...
taste
orphan <provider>
list
info <name>
write <dev> <lba> <text>
read <dev> <lba>
trim <dev> <lba> [count]
flush <dev>
store
debug <level>";

/// Parse a byte size with an optional K/M/G/T suffix.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&text[..text.len() - 1], 10),
        Some('M') => (&text[..text.len() - 1], 20),
        Some('G') => (&text[..text.len() - 1], 30),
        Some('T') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size {:?}", text))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| anyhow!("size {:?} overflows", text))
}

/// Byte offset and length of `count` blocks starting at `lba`.
fn block_range(lba: u64, count: u64, block_size: u64) -> Result<(u64, u64)> {
    let (Some(offset), Some(len)) = (lba.checked_mul(block_size), count.checked_mul(block_size))
    else {
        bail!("lba {} count {} overflows the byte range", lba, count);
    };
    Ok((offset, len))
}

fn nth_arg<'a>(words: &[&'a str], i: usize) -> Result<&'a str> {
    words
        .get(i)
        .copied()
        .ok_or_else(|| anyhow!("{}: missing argument {}", words[0], i))
}

/// One interpreter session: a provider namespace and the class loaded over it.
pub struct Session {
    class: DedupeClass,
}

impl Session {
    /// Create the store's backing provider and load the class over it. An
    /// existing store file is reopened with its contents.
    pub async fn new(
        config: DedupeConfig,
        store: &str,
        store_size: u64,
        store_file: Option<&Path>,
    ) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::new());
        let backing: Arc<dyn Provider> = match store_file {
            Some(path) => Arc::new(FileProvider::open_or_create(store, path, SECTOR, store_size)?),
            None => Arc::new(MemProvider::new(store, SECTOR, store_size)),
        };
        registry.insert(backing)?;
        let class = DedupeClass::init(config, registry, store).await?;
        Ok(Self { class })
    }

    /// The loaded class.
    pub fn class(&self) -> &DedupeClass {
        &self.class
    }

    /// Unload the class.
    pub async fn shutdown(&self) -> Result<()> {
        self.class.fini().await?;
        Ok(())
    }

    /// Run every line of `script`. Returns the number of failed commands.
    pub async fn run_script(&mut self, script: &str, out: &mut impl Write) -> Result<usize> {
        let mut errors = 0;
        for line in script.lines() {
            if !self.run_line(line, out).await? {
                errors += 1;
            }
        }
        Ok(errors)
    }

    /// Run one line, printing its output or its error. Returns false if the
    /// command failed; only output errors are returned as `Err`.
    pub async fn run_line(&mut self, line: &str, out: &mut impl Write) -> Result<bool> {
        match self.execute(line).await {
            Ok(Some(text)) => {
                writeln!(out, "{}", text)?;
                Ok(true)
            }
            Ok(None) => Ok(true),
            Err(e) => {
                match e.downcast_ref::<DedupeError>() {
                    Some(de) => writeln!(out, "error [{:?}]: {}", de.kind(), de)?,
                    None => writeln!(out, "error: {:#}", e)?,
                }
                Ok(false)
            }
        }
    }

    /// Execute one command line and return what it prints.
    pub async fn execute(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let arg = |i: usize| nth_arg(&words, i);
        let class = &self.class;

        match words[0] {
            "help" => Ok(Some(HELP.to_string())),
            "provider" => {
                let provider: Arc<dyn Provider> = match arg(1)? {
                    "mem" => Arc::new(MemProvider::new(arg(2)?, SECTOR, parse_size(arg(3)?)?)),
                    "file" => Arc::new(FileProvider::open_or_create(
                        arg(2)?,
                        arg(3)?,
                        SECTOR,
                        parse_size(arg(4)?)?,
                    )?),
                    other => bail!("unknown provider kind {:?}", other),
                };
                let name = provider.name().to_string();
                class.registry().insert(provider)?;
                Ok(Some(format!("provider {} registered", name)))
            }
            "create" => {
                let dev = class.create(arg(1)?, arg(2)?).await?;
                Ok(Some(format!(
                    "{} created, {} bytes",
                    dev.name(),
                    dev.media_size()
                )))
            }
            "destroy" => {
                let force = words.iter().skip(2).any(|w| *w == "--force" || *w == "-f");
                class.destroy(arg(1)?, force).await?;
                Ok(Some(format!("{} destroyed", arg(1)?)))
            }
            "wipe" => {
                let released = class.wipe(arg(1)?).await?;
                Ok(Some(format!("{} wiped, {} references released", arg(1)?, released)))
            }
            "configure" => {
                let settings: Vec<String> = words.iter().skip(2).map(|s| s.to_string()).collect();
                let options = class.configure(arg(1)?, &settings)?;
                Ok(Some(serde_json::to_string(&options)?))
            }
            "taste" => Ok(Some(class.taste_all().await.join("\n"))),
            "orphan" => Ok(Some(class.orphan(arg(1)?).await?.join("\n"))),
            "list" => Ok(Some(class.list().join("\n"))),
            "info" => Ok(Some(serde_json::to_string_pretty(&class.dumpconf(arg(1)?)?)?)),
            "store" => Ok(Some(serde_json::to_string_pretty(&class.store().stats())?)),
            "debug" => {
                let level: u32 = arg(1)?.parse().context("debug level")?;
                class.debug_level().set(level);
                Ok(None)
            }
            "write" => {
                let dev = class.device(arg(1)?)?;
                let lba: u64 = arg(2)?.parse().context("lba")?;
                let text = words.get(3..).map(|w| w.join(" ")).unwrap_or_default();
                let bs = class.config().block_size as usize;
                if text.len() > bs {
                    bail!("text longer than block size {}", bs);
                }
                let (offset, _) = block_range(lba, 1, bs as u64)?;
                let mut block = vec![0u8; bs];
                block[..text.len()].copy_from_slice(text.as_bytes());
                dev.write_at(offset, Bytes::from(block)).await?;
                Ok(None)
            }
            "read" => {
                let dev = class.device(arg(1)?)?;
                let lba: u64 = arg(2)?.parse().context("lba")?;
                let bs = class.config().block_size as usize;
                let (offset, _) = block_range(lba, 1, bs as u64)?;
                let data = dev.read_at(offset, bs).await?;
                let end = data.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                if end == 0 {
                    return Ok(Some(format!("{}: (zeros)", lba)));
                }
                Ok(Some(format!(
                    "{}: {}",
                    lba,
                    String::from_utf8_lossy(&data[..end])
                )))
            }
            "trim" => {
                let dev = class.device(arg(1)?)?;
                let lba: u64 = arg(2)?.parse().context("lba")?;
                let count: u64 = match words.get(3) {
                    Some(c) => c.parse().context("count")?,
                    None => 1,
                };
                let (offset, len) = block_range(lba, count, class.config().block_size as u64)?;
                dev.delete(offset, len).await?;
                Ok(None)
            }
            "flush" => {
                class.device(arg(1)?)?.flush().await?;
                Ok(None)
            }
            other => bail!("unknown command {:?} (try help)", other),
        }
    }
}
