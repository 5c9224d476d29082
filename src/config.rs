use crate::model::PersistedState;
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "upnext";
const STATE_FILE: &str = "state.json";
pub const CONFIG_DIR_ENV: &str = "UPNEXT_CONFIG_DIR";

pub fn config_root() -> Result<PathBuf> {
    if let Ok(override_dir) = env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(override_dir));
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    Ok(PathBuf::from(home).join(".config").join(APP_DIR))
}

pub fn state_path() -> Result<PathBuf> {
    Ok(config_root()?.join(STATE_FILE))
}

pub fn ensure_config_dir() -> Result<PathBuf> {
    let root = config_root()?;
    fs::create_dir_all(&root).with_context(|| format!("failed to create {}", root.display()))?;
    Ok(root)
}

pub fn load_state() -> Result<PersistedState> {
    load_state_from(&state_path()?)
}

pub fn load_state_from(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let state: PersistedState = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse state file {}", path.display()))?;
    Ok(state)
}

pub fn save_state(state: &PersistedState) -> Result<()> {
    ensure_config_dir()?;
    save_state_to(&state_path()?, state)
}

pub fn save_state_to(path: &Path, state: &PersistedState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn normalize_path(path: &Path) -> PathBuf {
    let canonical = path.canonicalize().unwrap_or_else(|_| {
        env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    });
    strip_windows_verbatim_prefix(&canonical)
}

pub fn strip_windows_verbatim_prefix(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();

    if let Some(trimmed) = raw.strip_prefix(r"\\?\UNC\") {
        return PathBuf::from(format!(r"\\{trimmed}"));
    }

    if let Some(trimmed) = raw.strip_prefix(r"\\?\") {
        return PathBuf::from(trimmed);
    }

    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AudioItem, BackwardStyle};
    use tempfile::tempdir;
    use url::Url;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(STATE_FILE);

        let mut state = PersistedState {
            shuffle: true,
            backward_style: BackwardStyle::AlwaysPrevious,
            current_index: Some(1),
            volume: 0.4,
            ..PersistedState::default()
        };
        state.queue.items = vec![
            AudioItem::new(Url::parse("https://example.com/a.mp3").expect("url"), "a"),
            AudioItem::new(Url::parse("https://example.com/b.mp3").expect("url"), "b"),
        ];
        state.tuning.preload_window_ms = 5_000;

        save_state_to(&path, &state).expect("save");
        let loaded = load_state_from(&path).expect("load");
        assert!(loaded.shuffle);
        assert_eq!(loaded.backward_style, BackwardStyle::AlwaysPrevious);
        assert_eq!(loaded.current_index, Some(1));
        assert_eq!(loaded.tuning.preload_window_ms, 5_000);
        let titles: Vec<_> = loaded.queue.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
    }

    #[test]
    fn missing_state_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded = load_state_from(&dir.path().join("absent.json")).expect("load");
        assert_eq!(loaded, PersistedState::default());
    }

    #[test]
    fn corrupt_state_file_reports_its_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(STATE_FILE);
        fs::write(&path, "{ not json").expect("write");
        let err = load_state_from(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("failed to parse state file"));
    }

    #[test]
    fn env_override_selects_config_root() {
        let dir = tempdir().expect("tempdir");
        unsafe {
            env::set_var(CONFIG_DIR_ENV, dir.path().to_string_lossy().as_ref());
        }
        assert_eq!(state_path().expect("path"), dir.path().join(STATE_FILE));
        save_state(&PersistedState::default()).expect("save");
        assert!(dir.path().join(STATE_FILE).exists());
    }

    #[test]
    fn strips_windows_verbatim_prefix() {
        let cleaned = strip_windows_verbatim_prefix(Path::new(r"\\?\E:\LOCALMUSIC\a.mp3"));
        assert_eq!(cleaned, PathBuf::from(r"E:\LOCALMUSIC\a.mp3"));
    }
}
