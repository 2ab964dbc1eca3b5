// fsel: keyboard-driven triage for directories of astrophoto exposures.
// Core: decoded-image LRU cache + bulk preloader, reversible PRETRASH
// triage, black/white/gamma display stretch.
// Usage: fsel [DIR] [--mem 4G] [--workers 4]

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: &str = env!("GIT_HASH");

mod cache;
mod catalog;
mod decode;
mod nav;
mod stretch;
mod triage;

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::Parser;

use cache::ImageCache;
use decode::ImageDecoder;
use nav::{FrameState, NavStep, NavigationController};
use stretch::StretchParam;

#[derive(Parser)]
#[command(name = "fsel", version = VERSION, about = "Fast triage for astrophoto exposure directories")]
struct Args {
    /// Directory of exposures to triage. Prompted for when omitted.
    directory: Option<PathBuf>,

    /// Cache memory budget, e.g. "512M" or "4G". Default: a quarter of RAM.
    #[arg(long)]
    mem: Option<String>,

    /// Decode worker threads. Default: available cores, capped at 8.
    #[arg(long)]
    workers: Option<usize>,
}

/// Parse "512M"-style budgets. Bare numbers are bytes.
fn parse_memory_budget(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1u64 << 10),
        'm' | 'M' => (&s[..s.len() - 1], 1u64 << 20),
        'g' | 'G' => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n.saturating_mul(mult))
}

fn default_memory_budget() -> u64 {
    let total = sysinfo::System::new_all().total_memory();
    if total == 0 {
        2 << 30
    } else {
        total / 4
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8)
}

fn prompt_directory() -> Option<PathBuf> {
    print!("Directory to open: ");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let dir = match args.directory.or_else(prompt_directory) {
        Some(d) => d,
        None => {
            eprintln!("fsel: no directory given");
            return;
        }
    };

    let budget = args
        .mem
        .as_deref()
        .and_then(parse_memory_budget)
        .unwrap_or_else(default_memory_budget);
    let workers = args.workers.unwrap_or_else(default_workers);

    eprintln!(
        "fsel {} ({}) — {} workers, {} MB cache budget",
        VERSION,
        GIT_HASH,
        workers,
        budget >> 20
    );

    let cache = ImageCache::new(Box::new(ImageDecoder), budget, workers);
    let mut nav = match NavigationController::open(&dir, cache) {
        Ok(nav) => nav,
        Err(e) => {
            eprintln!("fsel: {}", e);
            std::process::exit(1);
        }
    };

    println!("{} files in {}", nav.len(), dir.display());
    print_status(&mut nav);
    repl(&mut nav);
}

fn repl(nav: &mut NavigationController) {
    let stdin = std::io::stdin();
    loop {
        print!("fsel> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(_) => break,
        }
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();

        match cmd {
            "n" | "next" => run_nav(nav, NavStep::Delta(1)),
            "p" | "prev" => run_nav(nav, NavStep::Delta(-1)),
            "g" | "goto" => match rest.first().and_then(|s| s.parse::<usize>().ok()) {
                Some(n) if n >= 1 => run_nav(nav, NavStep::Absolute(n - 1)),
                _ => eprintln!("usage: goto <1-based index>"),
            },
            "0" | "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9" => {
                let key = cmd.parse::<usize>().unwrap();
                select_preset(nav, key);
            }
            "preset" => match rest.first().and_then(|s| s.parse::<usize>().ok()) {
                Some(key) => select_preset(nav, key),
                None => eprintln!("usage: preset <0-9>"),
            },
            "adjust" => adjust(nav, &rest),
            "t" | "trash" => match nav.toggle_triage() {
                Ok(dest) => {
                    println!("moved to {}", dest.display());
                    print_status(nav);
                }
                Err(e) => eprintln!("fsel: {}", e),
            },
            "pt" | "pretrash" => {
                let listing = nav.pretrash();
                if listing.is_empty() {
                    println!("PRETRASH is empty");
                }
                for (i, p) in listing.iter().enumerate() {
                    println!(
                        "  {}. {}",
                        i + 1,
                        p.file_name().unwrap_or_default().to_string_lossy()
                    );
                }
            }
            "restore" => match rest.first().and_then(|s| s.parse::<usize>().ok()) {
                Some(n) if n >= 1 => match nav.restore(n - 1) {
                    Ok(dest) => {
                        println!("restored {}", dest.display());
                        print_status(nav);
                    }
                    Err(e) => eprintln!("fsel: {}", e),
                },
                _ => eprintln!("usage: restore <1-based PRETRASH index>"),
            },
            "c" | "cache" => {
                let queued = nav.start_bulk_preload();
                println!("preloading {} files in the background", queued);
            }
            "stop" => {
                nav.cancel_bulk_preload();
                println!("preload cancelled");
            }
            "ls" => {
                let cursor = nav.current_index();
                for (i, e) in nav.entries().iter().enumerate() {
                    let marker = if Some(i) == cursor { ">" } else { " " };
                    println!(
                        " {} {}. {} ({} MB)",
                        marker,
                        i + 1,
                        e.file_name(),
                        e.size >> 20
                    );
                }
            }
            "h" | "header" => match nav.current_header() {
                Ok(header) => {
                    let mut keys: Vec<_> = header.keys().collect();
                    keys.sort();
                    for k in keys {
                        println!("  {} = {}", k, header[k]);
                    }
                }
                Err(e) => eprintln!("fsel: {}", e),
            },
            "failures" => {
                let failures = nav.preload_failures();
                if failures.is_empty() {
                    println!("no decode failures");
                }
                for (path, e) in failures {
                    println!("  {}: {}", path.display(), e);
                }
            }
            "save" => save_frame(nav, rest.first().copied()),
            "open" => match rest.first() {
                Some(d) => match nav.open_directory(Path::new(d)) {
                    Ok(count) => {
                        println!("{} files in {}", count, d);
                        print_status(nav);
                    }
                    Err(e) => eprintln!("fsel: {}", e),
                },
                None => eprintln!("usage: open <directory>"),
            },
            "s" | "status" => print_status(nav),
            "help" | "?" => print_help(),
            "q" | "quit" | "exit" => break,
            other => eprintln!("fsel: unknown command '{}' (try 'help')", other),
        }
    }
}

fn run_nav(nav: &mut NavigationController, step: NavStep) {
    if let Err(e) = nav.navigate(step) {
        eprintln!("fsel: {}", e);
    }
    print_status(nav);
}

fn select_preset(nav: &mut NavigationController, key: usize) {
    match nav.select_preset(key) {
        Ok(p) => {
            println!(
                "preset {}: black {:.4} white {:.4} gamma {:.2}",
                key, p.black, p.white, p.gamma
            );
            print_status(nav);
        }
        Err(e) => eprintln!("fsel: {}", e),
    }
}

fn adjust(nav: &mut NavigationController, rest: &[&str]) {
    let param = match rest.first().copied() {
        Some("black") => StretchParam::Black,
        Some("white") => StretchParam::White,
        Some("gamma") => StretchParam::Gamma,
        Some("r") => StretchParam::ScaleR,
        Some("g") => StretchParam::ScaleG,
        Some("b") => StretchParam::ScaleB,
        _ => {
            eprintln!("usage: adjust <black|white|gamma|r|g|b> <delta>");
            return;
        }
    };
    let Some(delta) = rest.get(1).and_then(|s| s.parse::<f32>().ok()) else {
        eprintln!("usage: adjust <black|white|gamma|r|g|b> <delta>");
        return;
    };
    let p = nav.adjust_custom(param, delta);
    println!(
        "custom: black {:.4} white {:.4} gamma {:.2} scale [{:.2} {:.2} {:.2}]",
        p.black, p.white, p.gamma, p.channel_scale[0], p.channel_scale[1], p.channel_scale[2]
    );
}

fn save_frame(nav: &mut NavigationController, arg: Option<&str>) {
    let FrameState::Ready(frame) = nav.current_frame() else {
        eprintln!("fsel: no frame to save");
        return;
    };
    let out = match arg {
        Some(p) => PathBuf::from(p),
        None => {
            let stem = nav
                .current_entry()
                .and_then(|e| e.path.file_stem().map(|s| s.to_string_lossy().to_string()))
                .unwrap_or_else(|| "frame".into());
            PathBuf::from(format!("{}_preview.png", stem))
        }
    };
    let color = match frame.channels {
        3 => image::ExtendedColorType::Rgb8,
        _ => image::ExtendedColorType::L8,
    };
    match image::save_buffer(&out, &frame.pixels, frame.width, frame.height, color) {
        Ok(()) => println!("saved {}", out.display()),
        Err(e) => eprintln!("fsel: save failed: {}", e),
    }
}

fn print_status(nav: &mut NavigationController) {
    let Some(index) = nav.current_index() else {
        println!("(no files)");
        return;
    };
    let (name, size_mb) = match nav.current_entry() {
        Some(e) => (e.file_name(), e.size >> 20),
        None => return,
    };
    let position = format!("[{}/{}]", index + 1, nav.len());
    match nav.current_frame() {
        FrameState::Ready(f) => {
            println!(
                "{} {} ({} MB) — {}x{}",
                position, name, size_mb, f.width, f.height
            )
        }
        FrameState::Pending => println!("{} {} ({} MB) — decoding...", position, name, size_mb),
        FrameState::Failed(e) => println!("{} {} — decode error: {}", position, name, e),
        FrameState::Empty => println!("(no files)"),
    }
    if nav.cache_over_budget() {
        println!("  (cache over budget)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_budget_suffixes() {
        assert_eq!(parse_memory_budget("512"), Some(512));
        assert_eq!(parse_memory_budget("2K"), Some(2048));
        assert_eq!(parse_memory_budget("512M"), Some(512 << 20));
        assert_eq!(parse_memory_budget("4g"), Some(4u64 << 30));
        assert_eq!(parse_memory_budget(" 1 G "), Some(1 << 30));
    }

    #[test]
    fn memory_budget_rejects_garbage() {
        assert_eq!(parse_memory_budget(""), None);
        assert_eq!(parse_memory_budget("lots"), None);
        assert_eq!(parse_memory_budget("G"), None);
    }
}

fn print_help() {
    println!(
        "\
  n/next, p/prev, goto N     move through the directory
  0-9, preset N              select a stretch preset
  adjust PARAM DELTA         nudge the custom preset (black/white/gamma/r/g/b)
  t/trash                    toggle the current file into/out of PRETRASH
  pretrash, restore N        list PRETRASH, move a file back
  c/cache, stop              preload every file / cancel the preload
  ls, status, header         listings and current-file info
  failures                   decode failures from the last preload
  save [FILE]                write the current frame as PNG
  open DIR                   switch to another directory
  q/quit                     leave"
    );
}
