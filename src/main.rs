//! tcp-fanout: a multi-threaded TCP traffic forwarder.
//!
//! Accepts connections on the configured endpoints and replicates every
//! byte each client sends to all configured upstream servers. Runs until
//! SIGINT or SIGTERM arrives.

use std::process::ExitCode;
use tcp_fanout::config::Config;
use tcp_fanout::forwarder::Forwarder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut forwarder = Forwarder::new(config.workers);
    for addr in &config.upstreams {
        forwarder.add_upstream(*addr);
    }

    for spec in &config.binds {
        if let Err(e) = forwarder.listen(spec) {
            error!(bind = %spec, error = %e, "Error listening");
            return ExitCode::FAILURE;
        }
        info!(bind = %spec, "Listening");
    }

    // The mask must be in place before the workers spawn so every thread
    // inherits it and the signals are delivered to sigwait alone.
    let signals = match SignalSet::block(&[libc::SIGINT, libc::SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Error blocking signals");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = forwarder.start(None) {
        error!(error = %e, "Error starting TCP forwarder");
        return ExitCode::FAILURE;
    }

    info!(
        upstreams = config.upstreams.len(),
        workers = config.workers,
        "Waiting for signal to arrive"
    );

    let signal = signals.wait();
    info!(signal, "Signal received, shutting down");

    forwarder.stop();

    ExitCode::SUCCESS
}

/// A set of signals blocked for the whole process.
struct SignalSet {
    set: libc::sigset_t,
}

impl SignalSet {
    /// Block `signals` on the calling thread; threads spawned afterwards
    /// inherit the mask.
    fn block(signals: &[libc::c_int]) -> std::io::Result<Self> {
        unsafe {
            let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            for &signal in signals {
                libc::sigaddset(set.as_mut_ptr(), signal);
            }
            let set = set.assume_init();

            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Self { set })
        }
    }

    /// Wait for one of the blocked signals to be delivered.
    fn wait(&self) -> libc::c_int {
        let mut signal = 0;
        // sigwait only fails with EINVAL for an empty set; retry covers
        // the spurious-wakeup case.
        while unsafe { libc::sigwait(&self.set, &mut signal) } != 0 {}
        signal
    }
}
