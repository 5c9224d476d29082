use anyhow::{Context, Result};
use std::cell::RefCell;
use std::io::BufRead;
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use upnext::audio::{AudioOutput, NullOutput, RodioOutput};
use upnext::error::StreamError;
use upnext::model::{AudioItem, BackwardStyle, PersistedState};
use upnext::player::{PlaybackState, Player, PlayerDelegate, RedrawReason};
use upnext::{config, duration, library, logging};
use url::Url;

const TICK: Duration = Duration::from_millis(33);

#[derive(Debug, Default)]
struct CliArgs {
    shuffle: bool,
    loop_queue: bool,
    loop_item: bool,
    always_previous: bool,
    volume: Option<f32>,
    restore: bool,
    device: Option<String>,
    list_devices: bool,
    sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Next,
    Previous,
    TogglePause,
    Play,
    Stop,
    Seek(Duration),
    Volume(f32),
    Shuffle,
    LoopQueue,
    LoopItem,
    Status,
    Quit,
}

#[derive(Default)]
struct ConsoleDelegate {
    redraws: RefCell<Vec<RedrawReason>>,
}

impl PlayerDelegate for ConsoleDelegate {
    fn ui_needs_redraw(&self, reason: RedrawReason) {
        self.redraws.borrow_mut().push(reason);
    }

    fn error_raised(&self, error: &StreamError, url: &Url) {
        error!(%url, kind = %error.kind, "{}", error.detail);
    }

    fn downloaded_bytes(&self, _downloaded: u64, _total: Option<u64>) {}

    fn progress_changed(&self, _elapsed: Duration, _total: Duration) {}

    fn audio_session_set_up(&self) {
        info!("audio session ready");
    }
}

fn main() -> Result<()> {
    logging::init();
    let args = parse_args(std::env::args().skip(1).collect())?;

    if args.list_devices {
        for name in RodioOutput::available_outputs() {
            println!("{name}");
        }
        return Ok(());
    }

    let mut state = if args.restore {
        config::load_state().context("failed to restore the last session")?
    } else {
        PersistedState::default()
    };
    let items = collect_items(&args.sources);
    if !items.is_empty() {
        state.queue.items = items;
        state.current_index = None;
    }
    if args.shuffle {
        state.shuffle = true;
    }
    if args.loop_queue {
        state.loop_queue = true;
    }
    if args.loop_item {
        state.loop_item = true;
    }
    if args.always_previous {
        state.backward_style = BackwardStyle::AlwaysPrevious;
    }
    if let Some(volume) = args.volume {
        state.volume = volume;
    }
    if state.queue.items.is_empty() {
        anyhow::bail!("nothing to play; pass files, folders or URLs, or use --restore");
    }

    let output = open_output(args.device.as_deref());
    let mut player = Player::from_persisted(output, state);
    player.set_metadata_loader(Box::new(library::LocalMetadataLoader));
    let console = Rc::new(ConsoleDelegate::default());
    let delegate: Rc<dyn PlayerDelegate> = console.clone();
    player.set_delegate(Rc::downgrade(&delegate));
    info!(output = %player.output_name(), items = player.queue().len(), "starting");

    let commands = spawn_stdin_reader()?;
    player.resume();
    run(&mut player, &console, &commands);

    config::save_state(&player.to_persisted()).context("failed to save the session")?;
    Ok(())
}

fn open_output(device: Option<&str>) -> Box<dyn AudioOutput> {
    match RodioOutput::new(device) {
        Ok(output) => Box::new(output),
        Err(err) => {
            warn!("no audio device available, playing silently: {err:#}");
            Box::new(NullOutput::new())
        }
    }
}

fn collect_items(sources: &[String]) -> Vec<AudioItem> {
    let mut items = Vec::new();
    for source in sources {
        if source.contains("://") {
            match library::item_for_url(source) {
                Ok(item) => items.push(item),
                Err(err) => warn!("skipping {source}: {err:#}"),
            }
            continue;
        }
        let path = Path::new(source);
        if path.is_dir() {
            for collection in library::scan_folder(path) {
                items.extend(collection.items);
            }
        } else {
            match library::item_for_path(path) {
                Ok(item) => items.push(item),
                Err(err) => warn!("skipping {source}: {err:#}"),
            }
        }
    }
    items
}

fn spawn_stdin_reader() -> Result<Receiver<Command>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("upnext-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match parse_command(&line) {
                    Some(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("unknown command: {}", line.trim()),
                }
            }
        })
        .context("failed to start the stdin reader")?;
    Ok(rx)
}

fn run(player: &mut Player, console: &ConsoleDelegate, commands: &Receiver<Command>) {
    let mut stdin_open = true;
    loop {
        if stdin_open {
            loop {
                match commands.try_recv() {
                    Ok(Command::Quit) => return,
                    Ok(command) => apply(player, command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stdin_open = false;
                        break;
                    }
                }
            }
        }

        player.tick();
        let redraws: Vec<RedrawReason> = console.redraws.borrow_mut().drain(..).collect();
        for reason in redraws {
            report(player, reason);
        }

        if !stdin_open
            && matches!(
                player.state(),
                PlaybackState::Stopped | PlaybackState::Error | PlaybackState::Idle
            )
        {
            return;
        }
        thread::sleep(TICK);
    }
}

fn apply(player: &mut Player, command: Command) {
    match command {
        Command::Next => {
            if !player.forward() {
                println!("end of queue");
            }
        }
        Command::Previous => {
            if !player.backward() {
                println!("start of queue");
            }
        }
        Command::TogglePause => match player.state() {
            PlaybackState::Playing | PlaybackState::Buffering => player.pause(),
            _ => player.resume(),
        },
        Command::Play => player.resume(),
        Command::Stop => player.stop(),
        Command::Seek(position) => player.seek_to(position),
        Command::Volume(volume) => {
            player.set_volume(volume);
            println!("volume {:.0}%", player.volume() * 100.0);
        }
        Command::Shuffle => {
            let shuffle = !player.shuffle();
            player.set_shuffle(shuffle);
            println!("shuffle {}", on_off(shuffle));
        }
        Command::LoopQueue => {
            let loop_queue = !player.loop_queue();
            player.set_loop_queue(loop_queue);
            println!("loop queue {}", on_off(loop_queue));
        }
        Command::LoopItem => {
            let loop_item = !player.loop_item();
            player.set_loop_item(loop_item);
            println!("loop track {}", on_off(loop_item));
        }
        Command::Status => print_status(player),
        Command::Quit => {}
    }
}

fn report(player: &Player, reason: RedrawReason) {
    match reason {
        RedrawReason::TrackChanged => {
            if let Some(item) = player.current_item() {
                let subtext = if item.display_subtext.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", item.display_subtext)
                };
                println!("> {}{subtext}", item.display_text);
            }
        }
        RedrawReason::Error => {
            if let Some(error) = player.last_error() {
                println!("error: {error}");
            }
        }
        RedrawReason::Buffering
        | RedrawReason::Playing
        | RedrawReason::Paused
        | RedrawReason::Stopped => println!("[{}]", player.state().label()),
        RedrawReason::QueueChanged => {}
    }
}

fn print_status(player: &Player) {
    let title = player
        .current_item()
        .map_or("nothing", |item| item.display_text.as_str());
    println!(
        "[{}] {title} {}/{}",
        player.state().label(),
        duration::formatted_time(player.elapsed()),
        duration::formatted_time(player.duration()),
    );
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let command = match parts.next()? {
        "n" | "next" => Command::Next,
        "p" | "prev" => Command::Previous,
        "space" | "pause" => Command::TogglePause,
        "play" => Command::Play,
        "stop" => Command::Stop,
        "seek" => {
            let seconds: f64 = parts.next()?.parse().ok()?;
            if !seconds.is_finite() || seconds < 0.0 {
                return None;
            }
            Command::Seek(Duration::from_secs_f64(seconds))
        }
        "vol" => Command::Volume(parts.next()?.parse().ok()?),
        "shuffle" => Command::Shuffle,
        "loop" => Command::LoopQueue,
        "one" => Command::LoopItem,
        "s" | "status" => Command::Status,
        "q" | "quit" => Command::Quit,
        _ => return None,
    };
    Some(command)
}

fn parse_args(args: Vec<String>) -> Result<CliArgs> {
    let mut out = CliArgs::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--shuffle" => out.shuffle = true,
            "--loop" => out.loop_queue = true,
            "--loop-one" => out.loop_item = true,
            "--always-previous" => out.always_previous = true,
            "--restore" => out.restore = true,
            "--list-devices" => out.list_devices = true,
            "--volume" => {
                index += 1;
                let Some(value) = args.get(index) else {
                    anyhow::bail!("--volume requires a value between 0 and 1");
                };
                let volume: f32 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid volume {value}"))?;
                if !(0.0..=1.0).contains(&volume) {
                    anyhow::bail!("--volume must be between 0 and 1");
                }
                out.volume = Some(volume);
            }
            "--device" => {
                index += 1;
                let Some(value) = args.get(index) else {
                    anyhow::bail!("--device requires an output name");
                };
                if value.trim().is_empty() {
                    anyhow::bail!("--device cannot be empty");
                }
                out.device = Some(value.trim().to_string());
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with("--") => anyhow::bail!("unknown argument {other}"),
            source => out.sources.push(source.to_string()),
        }
        index += 1;
    }
    Ok(out)
}

fn print_help() {
    println!("upnext [options] [PATH|URL]...");
    println!("  --shuffle           Play in shuffled order");
    println!("  --loop              Wrap around at the end of the queue");
    println!("  --loop-one          Repeat the current track");
    println!("  --always-previous   'p' always goes to the previous track");
    println!("  --volume V          Start at volume V (0 to 1)");
    println!("  --restore           Continue the last saved session");
    println!("  --device NAME       Use a specific output device");
    println!("  --list-devices      Print output devices and exit");
    println!();
    println!("commands: n, p, space|pause, play, stop, seek S, vol V, shuffle, loop, one, status, q");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn flags_and_sources_are_parsed() {
        let parsed = parse_args(args(&["--shuffle", "--volume", "0.5", "a.mp3", "dir"]))
            .expect("parse");
        assert!(parsed.shuffle);
        assert_eq!(parsed.volume, Some(0.5));
        assert_eq!(parsed.sources, vec!["a.mp3", "dir"]);
    }

    #[test]
    fn bad_volume_is_rejected() {
        assert!(parse_args(args(&["--volume"])).is_err());
        assert!(parse_args(args(&["--volume", "loud"])).is_err());
        assert!(parse_args(args(&["--volume", "2"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("n"), Some(Command::Next));
        assert_eq!(parse_command(" pause "), Some(Command::TogglePause));
        assert_eq!(
            parse_command("seek 12.5"),
            Some(Command::Seek(Duration::from_millis(12_500)))
        );
        assert_eq!(parse_command("vol 0.3"), Some(Command::Volume(0.3)));
        assert_eq!(parse_command("seek -1"), None);
        assert_eq!(parse_command("seek"), None);
        assert_eq!(parse_command("dance"), None);
    }
}
