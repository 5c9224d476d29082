use crate::audio::probe;
use crate::config;
use crate::model::{Artwork, ArtworkResolver, AudioItem, AudioItemCollection, MetadataLoader};
use anyhow::{Context, Result, anyhow};
use lofty::file::{AudioFile, TaggedFile, TaggedFileExt};
use lofty::picture::PictureType;
use lofty::probe::Probe;
use lofty::tag::Accessor;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::default::get_probe;
use tracing::debug;
use url::Url;
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "ogg", "m4a", "aac", "opus"];

#[derive(Debug, Default)]
struct TrackMetadata {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    track_number: Option<u32>,
    duration: Option<Duration>,
    has_artwork: bool,
}

pub fn scan_folder(root: &Path) -> Vec<AudioItemCollection> {
    group_by_folder(audio_files(root))
}

pub fn scan_many(roots: &[PathBuf]) -> Vec<AudioItemCollection> {
    let mut files: Vec<PathBuf> = roots.iter().flat_map(|root| audio_files(root)).collect();
    files.sort();
    files.dedup();
    group_by_folder(files)
}

fn audio_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_audio(entry.path()))
        .map(|entry| config::normalize_path(entry.path()))
        .collect();
    files.sort();
    files
}

fn group_by_folder(files: Vec<PathBuf>) -> Vec<AudioItemCollection> {
    let mut folders: BTreeMap<PathBuf, Vec<AudioItem>> = BTreeMap::new();
    for path in files {
        let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
        match item_for_path(&path) {
            Ok(item) => folders.entry(folder).or_default().push(item),
            Err(err) => debug!(path = %path.display(), "skipping file: {err:#}"),
        }
    }

    folders
        .into_iter()
        .map(|(folder, mut items)| {
            items.sort_by(|a, b| {
                a.track_number
                    .unwrap_or(u32::MAX)
                    .cmp(&b.track_number.unwrap_or(u32::MAX))
                    .then_with(|| a.playback_url.cmp(&b.playback_url))
            });
            let name = folder
                .file_name()
                .and_then(OsStr::to_str)
                .unwrap_or("Library")
                .to_string();
            let mut collection = AudioItemCollection::new(name, items);
            collection.display_subtext = shared_artist(&collection.items).unwrap_or_default();
            collection
        })
        .collect()
}

fn shared_artist(items: &[AudioItem]) -> Option<String> {
    let first = items.first()?.artist.as_str();
    (!first.is_empty() && items.iter().all(|item| item.artist == first))
        .then(|| first.to_string())
}

pub fn item_for_path(path: &Path) -> Result<AudioItem> {
    let normalized = config::normalize_path(path);
    if !normalized.is_file() {
        return Err(anyhow!("{} is not a file", normalized.display()));
    }
    let url = Url::from_file_path(&normalized)
        .map_err(|()| anyhow!("cannot express {} as a URL", normalized.display()))?;
    let mut item = AudioItem::new(url, String::new());
    apply_metadata(&mut item, &normalized, metadata_for(&normalized));
    Ok(item)
}

pub fn item_for_url(raw: &str) -> Result<AudioItem> {
    let url = Url::parse(raw).with_context(|| format!("invalid stream URL {raw}"))?;
    let title = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or(raw)
        .to_string();
    Ok(AudioItem::new(url, title))
}

fn apply_metadata(item: &mut AudioItem, path: &Path, metadata: TrackMetadata) {
    item.title = metadata
        .title
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(OsStr::to_str)
                .unwrap_or("unknown")
                .to_string()
        });
    item.artist = metadata.artist.unwrap_or_default();
    item.album = metadata.album.unwrap_or_default();
    item.track_number = metadata.track_number;
    item.duration = metadata.duration.unwrap_or_default();
    item.display_text = item.title.clone();
    item.display_subtext = match (item.artist.is_empty(), item.album.is_empty()) {
        (false, false) => format!("{} - {}", item.artist, item.album),
        (false, true) => item.artist.clone(),
        (true, false) => item.album.clone(),
        (true, true) => String::new(),
    };
    if metadata.has_artwork {
        item.album_art = Some(item.playback_url.clone());
    }
    item.metadata_loaded = true;
}

fn metadata_for(path: &Path) -> TrackMetadata {
    let stripped = config::strip_windows_verbatim_prefix(path);
    let mut metadata = symphonia_metadata(&stripped);
    let tagged = tagged_file(&stripped);

    if let Some(tagged) = &tagged {
        if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
            metadata.title = metadata
                .title
                .or_else(|| tag.title().and_then(|value| clean_metadata_value(&value)));
            metadata.artist = metadata
                .artist
                .or_else(|| tag.artist().and_then(|value| clean_metadata_value(&value)));
            metadata.album = metadata
                .album
                .or_else(|| tag.album().and_then(|value| clean_metadata_value(&value)));
            metadata.track_number = metadata.track_number.or_else(|| tag.track());
            metadata.has_artwork = !tag.pictures().is_empty();
        }
        let duration = tagged.properties().duration();
        if !duration.is_zero() {
            metadata.duration = Some(duration);
        }
    }

    if metadata.duration.is_none() {
        metadata.duration = probe::probe_file(&stripped)
            .ok()
            .and_then(|report| report.duration);
    }
    metadata
}

fn tagged_file(path: &Path) -> Option<TaggedFile> {
    Probe::open(path).and_then(|probe| probe.read()).ok()
}

fn symphonia_metadata(path: &Path) -> TrackMetadata {
    let Ok(file) = File::open(path) else {
        return TrackMetadata::default();
    };
    let source = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(OsStr::to_str) {
        hint.with_extension(extension);
    }

    let Ok(mut probed) = get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) else {
        return TrackMetadata::default();
    };

    let duration = probed
        .format
        .default_track()
        .and_then(|track| probe::codec_duration(&track.codec_params));
    let metadata = probed.format.metadata();
    let Some(revision) = metadata.current() else {
        return TrackMetadata {
            duration,
            ..TrackMetadata::default()
        };
    };

    let tags = revision.tags();
    TrackMetadata {
        title: tag_value(tags, StandardTagKey::TrackTitle, &["title"]),
        artist: tag_value(
            tags,
            StandardTagKey::Artist,
            &["artist", "albumartist", "album_artist"],
        ),
        album: tag_value(tags, StandardTagKey::Album, &["album"]),
        track_number: tag_value(tags, StandardTagKey::TrackNumber, &["tracknumber", "track"])
            .and_then(|value| parse_track_number(&value)),
        duration,
        has_artwork: false,
    }
}

fn tag_value(
    tags: &[symphonia::core::meta::Tag],
    standard_key: StandardTagKey,
    fallback_keys: &[&str],
) -> Option<String> {
    let from_standard = tags
        .iter()
        .find(|tag| tag.std_key == Some(standard_key))
        .map(|tag| tag.value.to_string());

    let from_fallback = || {
        tags.iter()
            .find(|tag| {
                fallback_keys
                    .iter()
                    .any(|key| tag.key.eq_ignore_ascii_case(key))
            })
            .map(|tag| tag.value.to_string())
    };

    from_standard
        .or_else(from_fallback)
        .and_then(|value| clean_metadata_value(&value))
}

fn clean_metadata_value(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// Accepts "7" as well as "7/12".
fn parse_track_number(value: &str) -> Option<u32> {
    value.split('/').next()?.trim().parse().ok()
}

pub fn is_audio(path: &Path) -> bool {
    let ext = path.extension().and_then(OsStr::to_str).unwrap_or_default();
    AUDIO_EXTENSIONS
        .iter()
        .any(|supported| ext.eq_ignore_ascii_case(supported))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMetadataLoader;

impl MetadataLoader for LocalMetadataLoader {
    fn load_metadata(&self, item: &AudioItem, done: Box<dyn FnOnce(AudioItem) + Send>) {
        let mut item = item.clone();
        let spawned = thread::Builder::new()
            .name("upnext-metadata".to_string())
            .spawn(move || {
                if let Some(path) = local_path(&item.playback_url) {
                    let metadata = metadata_for(&path);
                    apply_metadata(&mut item, &path, metadata);
                } else {
                    item.metadata_loaded = true;
                }
                done(item);
            });
        if let Err(err) = spawned {
            debug!("metadata thread did not start: {err}");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedArtworkResolver;

impl ArtworkResolver for EmbeddedArtworkResolver {
    fn resolve(&self, url: &Url, done: Box<dyn FnOnce(Option<Artwork>) + Send>) {
        let artwork = local_path(url)
            .and_then(|path| embedded_cover_art(&path))
            .map(|bytes| Artwork {
                url: url.clone(),
                bytes,
            });
        done(artwork);
    }
}

fn local_path(url: &Url) -> Option<PathBuf> {
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

pub fn embedded_cover_art(path: &Path) -> Option<Vec<u8>> {
    let tagged = tagged_file(&config::strip_windows_verbatim_prefix(path))?;
    let tag = tagged.primary_tag().or_else(|| tagged.first_tag())?;
    let pictures = tag.pictures();
    pictures
        .iter()
        .find(|picture| picture.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first())
        .map(|picture| picture.data().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::probe::fixtures::write_test_wav;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn scan_groups_audio_by_folder() {
        let dir = tempdir().expect("tempdir");
        let first = dir.path().join("First");
        let second = dir.path().join("Second");
        fs::create_dir_all(&first).expect("mkdir");
        fs::create_dir_all(&second).expect("mkdir");
        write_test_wav(&first.join("b.wav"), 200);
        write_test_wav(&first.join("a.wav"), 200);
        write_test_wav(&second.join("c.wav"), 200);
        fs::write(first.join("notes.txt"), b"x").expect("write txt");

        let collections = scan_folder(dir.path());
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].display_text, "First");
        let titles: Vec<&str> = collections[0]
            .items
            .iter()
            .map(|item| item.title.as_str())
            .collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert!(
            collections[0]
                .items
                .iter()
                .all(|item| item.collection == Some(collections[0].id))
        );
        assert_eq!(collections[1].items.len(), 1);
    }

    #[test]
    fn scan_many_drops_duplicates() {
        let dir = tempdir().expect("tempdir");
        write_test_wav(&dir.path().join("a.wav"), 200);
        let roots = vec![dir.path().to_path_buf(), dir.path().to_path_buf()];
        let collections = scan_many(&roots);
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].items.len(), 1);
    }

    #[test]
    fn local_items_carry_file_urls_and_duration() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 1_000);

        let item = item_for_path(&path).expect("item");
        assert_eq!(item.playback_url.scheme(), "file");
        assert_eq!(item.title, "tone");
        assert!(item.metadata_loaded);
        assert!(item.duration >= Duration::from_millis(900));
        assert!(item.duration <= Duration::from_millis(1_100));
    }

    #[test]
    fn missing_paths_are_rejected() {
        let dir = tempdir().expect("tempdir");
        assert!(item_for_path(&dir.path().join("gone.wav")).is_err());
    }

    #[test]
    fn remote_items_are_titled_from_the_path() {
        let item = item_for_url("https://example.com/shows/episode-4.mp3").expect("item");
        assert_eq!(item.title, "episode-4.mp3");
        assert!(!item.metadata_loaded);
        assert!(item_for_url("not a url").is_err());
    }

    #[test]
    fn loader_fills_in_local_metadata() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("late.wav");
        write_test_wav(&path, 500);
        let url = Url::from_file_path(config::normalize_path(&path)).expect("url");
        let bare = AudioItem::new(url, "placeholder");

        let (tx, rx) = mpsc::channel();
        LocalMetadataLoader.load_metadata(
            &bare,
            Box::new(move |item| {
                let _ = tx.send(item);
            }),
        );
        let loaded = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("metadata callback");
        assert_eq!(loaded.playback_id(), bare.playback_id());
        assert_eq!(loaded.title, "late");
        assert!(loaded.metadata_loaded);
        assert!(!loaded.duration.is_zero());
    }

    #[test]
    fn track_numbers_accept_totals() {
        assert_eq!(parse_track_number("7/12"), Some(7));
        assert_eq!(parse_track_number(" 3 "), Some(3));
        assert_eq!(parse_track_number("side a"), None);
    }

    #[test]
    fn resolver_returns_none_without_pictures() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("plain.wav");
        write_test_wav(&path, 100);
        let url = Url::from_file_path(config::normalize_path(&path)).expect("url");

        let (tx, rx) = mpsc::channel();
        EmbeddedArtworkResolver.resolve(
            &url,
            Box::new(move |artwork| {
                let _ = tx.send(artwork);
            }),
        );
        assert_eq!(rx.recv().expect("callback"), None);
    }
}
