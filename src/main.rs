//! chipstream CLI — plays an XM module or renders it to WAV.
//!
//! Usage:
//!   chipstream path/to/file.xm
//!   chipstream path/to/file.xm --wav output.wav
//!   chipstream path/to/file.xm --loop --volume 0.6 --interpolate

use chip_engine::LoadModuleConfig;
use chip_master::Controller;
use std::io::Write;
use std::{env, fs};

fn main() {
    let args: Vec<String> = env::args().collect();
    let path = args.get(1).unwrap_or_else(|| {
        eprintln!("Usage: chipstream <file.xm> [--wav output.wav] [--loop] [--volume V] [--interpolate]");
        std::process::exit(1);
    });

    let wav_path = args
        .iter()
        .position(|a| a == "--wav")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let volume: f64 = args
        .iter()
        .position(|a| a == "--volume")
        .and_then(|i| args.get(i + 1))
        .map(|s| {
            s.parse().unwrap_or_else(|_| {
                eprintln!("--volume requires a number in 0..1");
                std::process::exit(1);
            })
        })
        .unwrap_or(0.8);

    let looping = args.iter().any(|a| a == "--loop");
    let interpolate = args.iter().any(|a| a == "--interpolate");

    let data = fs::read(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path, e);
        std::process::exit(1);
    });

    let mut ctrl = Controller::new();
    ctrl.set_config(LoadModuleConfig {
        linear_interpolation: interpolate,
        ..Default::default()
    });
    ctrl.set_volume(volume);
    ctrl.set_looping(looping);
    ctrl.load_xm(&data).unwrap_or_else(|e| {
        eprintln!("Failed to load {}: {}", path, e);
        std::process::exit(1);
    });

    print_info(&ctrl);

    match wav_path {
        Some(wav) => render_to_wav(&ctrl, &wav),
        None => play_audio(&mut ctrl),
    }
}

fn print_info(ctrl: &Controller) {
    let m = ctrl.module().expect("module was just loaded");
    println!("Name:        {}", m.name);
    println!("Tracker:     {}", m.tracker_name);
    println!("Channels:    {}", m.num_channels);
    println!("Patterns:    {}", m.num_patterns);
    println!("Instruments: {}", m.num_instruments);
    println!("Orders:      {}", m.song_length);
    println!("Tempo:       {} BPM, Spd: {}", m.default_bpm, m.default_tempo);
    if let Ok(bytes) = ctrl.memory_usage() {
        println!("Compiled:    {:.1} KiB", bytes as f64 / 1024.0);
    }
    println!();
}

fn play_audio(ctrl: &mut Controller) {
    if let Err(e) = ctrl.play() {
        eprintln!("Failed to start playback: {}", e);
        std::process::exit(1);
    }
    println!("Playing...");

    while ctrl.is_playing() {
        if let Some(seconds) = ctrl.position() {
            print!("\r{:>7.2}s", seconds);
            let _ = std::io::stdout().flush();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    println!("\rDone.          ");
}

fn render_to_wav(ctrl: &Controller, path: &str) {
    let max_seconds = 600;
    println!("Rendering to {}...", path);

    let wav = ctrl.render_to_wav(max_seconds).unwrap_or_else(|e| {
        eprintln!("Failed to render: {}", e);
        std::process::exit(1);
    });
    println!("Rendered {} bytes ({:.1}s)", wav.len(), (wav.len() - 44) as f64 / (44100.0 * 4.0));

    fs::write(path, &wav).unwrap_or_else(|e| {
        eprintln!("Failed to write {}: {}", path, e);
        std::process::exit(1);
    });

    println!("Done.");
}
