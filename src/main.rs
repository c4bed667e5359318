//! Emu Sound Sync - 模拟器声音输出同步
//!
//! 设计目标：
//! - 模拟速度跟着墙钟走：定点漂移补偿时钟
//! - 声音不断也不爆：lock-free 块缓冲区 + 斜坡过渡
//! - 两边慢慢对齐：按缓冲区水位每秒微调模拟时钟

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use emu_sound_sync::audio::{
    BufferConfig, MonotonicClock, OutputConfig, PcmSample, StreamFormat, ThreadedOutput,
    WallClock,
};
use emu_sound_sync::clock::ClockConfig;
use emu_sound_sync::engine::{EngineConfig, SoundEngine};
use emu_sound_sync::sim::{run_simulation, SimConfig};

/// Emu Sound Sync - Audio output synchronization for emulators
#[derive(Parser)]
#[command(name = "emu-sound-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Output sample rate
    #[arg(long, default_value = "22255", global = true)]
    sample_rate: u32,

    /// Samples pulled per output callback
    #[arg(long, default_value = "1024", global = true)]
    block_frames: usize,

    /// Number of blocks in the sample buffer (power of two, at least 4)
    #[arg(long, default_value = "16", global = true)]
    buffers: u32,

    /// Samples per block (power of two)
    #[arg(long, default_value = "512", global = true)]
    block_len: u32,

    /// Emulated tick rate in Hz
    #[arg(long, default_value = "60.14742", global = true)]
    tick_hz: f64,

    /// Use 8-bit unsigned samples instead of 16-bit signed
    #[arg(long, global = true)]
    eight_bit: bool,

    /// Lock the sample buffer in memory
    #[arg(long, global = true)]
    lock_memory: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Info,

    /// Run a synthetic emulator against a simulated output device
    Simulate {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        seconds: f64,

        /// Maximum random host stall in milliseconds
        #[arg(short, long, default_value = "0")]
        jitter_ms: u32,

        /// Square wave frequency in Hz
        #[arg(long, default_value = "440")]
        tone_hz: u32,

        /// Random seed for the host stalls
        #[arg(long)]
        seed: Option<u64>,
    },
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            buffer: BufferConfig {
                buffers: self.buffers,
                block_len: self.block_len,
            },
            clock: ClockConfig::from_frequency(self.tick_hz),
            output: OutputConfig {
                sample_rate: self.sample_rate,
                block_frames: self.block_frames,
            },
            lock_memory: self.lock_memory,
            ..EngineConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Some(Commands::Info) | None => {
            show_info(&cli)?;
        }
        Some(Commands::Simulate {
            seconds,
            jitter_ms,
            tone_hz,
            seed,
        }) => {
            let sim = SimConfig {
                duration: Duration::from_secs_f64(seconds.max(0.0)),
                tone_hz,
                jitter_ms,
                seed,
                ..SimConfig::default()
            };
            if cli.eight_bit {
                simulate::<u8>(&cli, &sim)?;
            } else {
                simulate::<i16>(&cli, &sim)?;
            }
        }
    }

    Ok(())
}

/// 显示配置
fn show_info(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.engine_config();
    config.validate()?;

    let (rate, frames) = (config.output.sample_rate, config.output.block_frames);
    let format = if cli.eight_bit {
        StreamFormat::new::<u8>(rate, frames)
    } else {
        StreamFormat::new::<i16>(rate, frames)
    };

    println!("=== Sound Sync Configuration ===\n");
    println!(
        "Output:   {}Hz {}-bit mono, {} samples per callback ({:.1}ms)",
        format.sample_rate,
        format.bits_per_sample,
        format.block_frames,
        format.callback_period_ns() as f64 / 1_000_000.0
    );
    println!(
        "Buffer:   {} × {} samples = {} ({} bytes, {:.0}ms)",
        config.buffer.buffers,
        config.buffer.block_len,
        config.buffer.capacity(),
        config.buffer.capacity() as usize * format.bytes_per_sample(),
        config.buffer_latency_ms()
    );
    println!(
        "Clock:    {:.5}Hz (step {:#x}), stall threshold {}ms",
        config.clock.frequency(),
        config.clock.step,
        config.clock.stall_threshold_ms
    );
    println!(
        "Playback: prime {} blocks, target {} blocks ({:.0}ms), ramp step {:#x}",
        config.playback.prime_buffers,
        config.playback.desired_min_filled,
        config.target_latency_ms(),
        config.playback.ramp_step
    );

    Ok(())
}

/// 模拟运行
fn simulate<T: PcmSample>(cli: &Cli, sim: &SimConfig) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let wall = MonotonicClock;
    let output = ThreadedOutput::<T>::discard();
    let mut engine = SoundEngine::<T>::open(cli.engine_config(), wall.now_ms(), Box::new(output))?;

    println!("Emu Sound Sync - Simulation ({} bits)", T::BITS);
    println!("Press Ctrl+C to stop.\n");

    let report = run_simulation(&mut engine, &wall, sim, &running);
    if !running.load(Ordering::SeqCst) {
        println!("Simulation interrupted.\n");
    }

    engine.shutdown()?;
    println!("{}", report);

    Ok(())
}
