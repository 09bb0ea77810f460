use log::{error, info};
use p1gateway::{
    DistributionHub, DomoticzPusher, MqttReporter, P1Port, P1Reader, RollingLog, SessionConsole,
    CONFIG,
};
use std::{env, time::Duration};
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("P1GW_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    env::set_var("RUST_BACKTRACE", "1");

    let config = CONFIG.clone();

    // the hub hands every sink its own queue before the reader takes over
    let mut hub = DistributionHub::new();
    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    if config.mqtt.enabled {
        let rx = hub.register("mqtt");
        let mut mqtt = MqttReporter::new(config.mqtt.clone(), rx);
        threads.push(tokio::spawn(async move {
            mqtt.start_thread().await;
        }));
    }

    if config.telnet.enabled {
        let rx = hub.register("telnet");
        let mut console = SessionConsole::new(config.telnet.clone(), rx);
        threads.push(tokio::spawn(async move {
            console.start_thread().await;
        }));
    }

    if config.domoticz.enabled {
        let rx = hub.register("domoticz");
        let mut domoticz = DomoticzPusher::new(config.domoticz.clone(), rx);
        threads.push(tokio::spawn(async move {
            domoticz.start_thread().await;
        }));
    }

    /* The rolling 24h log always runs */
    let rx = hub.register("history");
    let mut history = RollingLog::open(config.history.path.clone());
    threads.push(tokio::spawn(async move {
        history.start_thread(rx).await;
    }));

    /* Last but not least start reading the meter */
    let port = match P1Port::open(&config.p1.port, config.p1.baud) {
        Ok(port) => port,
        Err(e) => {
            error!("[P1] Unable to open {}: {e}", config.p1.port);
            std::process::exit(1);
        }
    };
    let mut reader = P1Reader::new(port, hub, &config.p1);
    threads.push(tokio::spawn(async move {
        reader.run().await;
    }));

    info!("All modules started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
