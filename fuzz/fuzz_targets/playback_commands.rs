#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use upnext::audio::{NullControl, NullOutput};
use upnext::model::{AudioItem, BackwardStyle, PlaybackTuning};
use upnext::player::Player;
use upnext::queue::UpNextQueue;
use url::Url;

fn item(serial: usize) -> Option<AudioItem> {
    let url = Url::parse(&format!("https://fuzz.invalid/track_{serial}.mp3")).ok()?;
    Some(AudioItem::new(url, format!("track {serial}")))
}

fuzz_target!(|data: &[u8]| {
    let Some((&seed, commands)) = data.split_first() else {
        return;
    };
    let control = NullControl::default();
    control.set_default_duration(Some(Duration::from_secs(30)));
    let mut queue = UpNextQueue::with_seed(u64::from(seed));
    let len = usize::from(seed % 16) + 1;
    queue.append_items((0..len).filter_map(item).collect());
    let mut player = Player::with_queue(
        Box::new(NullOutput::with_control(control.clone())),
        PlaybackTuning::default(),
        queue,
    );
    let mut serial = len;

    for pair in commands.chunks(2) {
        let op = pair[0];
        let arg = usize::from(pair.get(1).copied().unwrap_or_default());
        match op % 14 {
            0 => {
                player.forward();
            }
            1 => {
                player.backward();
            }
            2 => {
                player.set_index(arg % 24);
            }
            3 => {
                player.edit_queue(|queue| queue.remove_item_at(arg % 24));
            }
            4 => {
                serial += 1;
                if let Some(item) = item(serial) {
                    player.edit_queue(|queue| queue.insert_item(item, arg));
                }
            }
            5 => {
                player.edit_queue(|queue| queue.move_item_at(arg % 16, arg / 16));
            }
            6 => {
                let shuffle = !player.shuffle();
                player.set_shuffle(shuffle);
            }
            7 => {
                let looping = !player.loop_queue();
                player.set_loop_queue(looping);
            }
            8 => {
                let looping = !player.loop_item();
                player.set_loop_item(looping);
            }
            9 => player.set_backward_style(if arg % 2 == 0 {
                BackwardStyle::RestartTrack
            } else {
                BackwardStyle::AlwaysPrevious
            }),
            10 => player.seek_to(Duration::from_secs(arg as u64)),
            11 => {
                if let Some(url) = player.current_item().map(|item| item.playback_url.clone()) {
                    control.set_position(&url, Duration::from_secs(25));
                }
                player.tick();
            }
            12 => {
                if let Some(url) = player.current_item().map(|item| item.playback_url.clone()) {
                    control.finish(&url);
                }
                player.tick();
            }
            _ => {
                if arg % 3 == 0 {
                    player.stop();
                } else {
                    player.resume();
                }
            }
        }

        let len = player.queue().len();
        assert!(player.current_index().is_none_or(|index| index < len));
        let mut order = player.queue().shuffle_order().to_vec();
        order.sort_unstable();
        assert!(order.iter().copied().eq(0..len));
    }
});
