use std::sync::Mutex;
use std::thread;

use log::LevelFilter;
use log_mgr::{Config, LogMgr};

struct Args {
    threads: u64,
    sections: u64,
    stores_per_section: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            threads: 4,
            sections: 1000,
            stores_per_section: 16,
        }
    }
}

impl Args {
    fn parse() -> Result<Self, pico_args::Error> {
        let mut pargs = pico_args::Arguments::from_env();
        let mut args = Args::default();
        if let Some(v) = pargs.opt_value_from_str("--threads")? {
            args.threads = v;
        }
        if let Some(v) = pargs.opt_value_from_str("--sections")? {
            args.sections = v;
        }
        if let Some(v) = pargs.opt_value_from_str("--stores-per-section")? {
            args.stores_per_section = v;
        }
        Ok(args)
    }
}

fn main() {
    env_logger::builder().filter_level(LevelFilter::Info).init();
    let args = Args::parse().expect("failed to parse args");
    log::info!(
        "starting nvmlog demo: {} threads x {} sections x {} stores",
        args.threads,
        args.sections,
        args.stores_per_section
    );

    let mgr = LogMgr::new(Config::from_env()).expect("failed to initialize log manager");
    let lock = Mutex::new(());
    let lock_addr = &lock as *const _ as u64;

    thread::scope(|scope| {
        for _ in 0..args.threads {
            let mgr = &mgr;
            let lock = &lock;
            scope.spawn(move || {
                let mut handle = mgr.register_thread();
                // stand-in for a persistent heap the instrumented code writes
                let mut data = vec![0u8; 4096];
                for section in 0..args.sections {
                    let guard = lock.lock().unwrap();
                    handle.acquire(lock_addr);
                    for i in 0..args.stores_per_section {
                        let offset = ((section * 31 + i * 8) % 4088) as usize;
                        data[offset..offset + 8].copy_from_slice(&section.to_le_bytes());
                        handle.store(data[offset..].as_ptr() as u64, 64);
                    }
                    handle.release(lock_addr);
                    drop(guard);
                }
                log::info!("thread {} done", handle.thread_tag());
            });
        }
    });

    mgr.shutdown();
}
