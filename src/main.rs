//! `camstream` entry point
//!
//! Streams every enabled camera in `CAMSTREAM_CONFIG` until Ctrl-C.

fn main() {
    if let Err(e) = camstream_lib::run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
