use std::time::Instant;

use log::{error, info};

use mnist_unpack::{config::Config, convert};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let start_time = Instant::now();
    let summary = Config::default()
        .validate()
        .and_then(|config| convert::run(&config))
        .and_then(|report| report.to_json());
    match summary {
        Ok(summary) => println!("{}", summary),
        Err(e) => {
            error!("Conversion failed: {}", e);
            std::process::exit(1);
        }
    }
    info!("Done: time({:?})", start_time.elapsed());
}
