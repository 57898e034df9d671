//! Simulated vendor HAL process: serves the parameter actions over a small
//! in-memory store and publishes link-status events on an interval.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use hashbrown::HashMap;

use halbus::logging;
use halbus::message::{self, action, HalParam, ParamValue, Status};
use halbus::shared::HalError;
use halbus::HalServer;

const DSL_LINK_EVENT: &str = "Device.DSL.Line.1.LinkStatus";
const ETH_LINK_EVENT: &str = "Device.Ethernet.Interface.1.LinkStatus";

/// Seconds between simulated event rounds.
const EVENT_INTERVAL: Duration = Duration::from_secs(10);

type ParamStore = Arc<Mutex<HashMap<String, ParamValue>>>;

fn seed_store() -> ParamStore {
    let mut store = HashMap::new();
    store.insert(
        "Device.DSL.Line.1.Enable".to_owned(),
        ParamValue::Boolean(true),
    );
    store.insert(
        DSL_LINK_EVENT.to_owned(),
        ParamValue::Str("Up".to_owned()),
    );
    store.insert(
        ETH_LINK_EVENT.to_owned(),
        ParamValue::Str("Down".to_owned()),
    );
    store.insert(
        "Device.DSL.Line.1.Stats.BytesSent".to_owned(),
        ParamValue::UnsignedLong(0),
    );
    Arc::new(Mutex::new(store))
}

fn register_handlers(server: &HalServer, store: &ParamStore) {
    let get_store = Arc::clone(store);
    server
        .register_action(action::GET_PARAMETERS, move |request, count, reply| {
            let store = get_store.lock().unwrap();
            for index in 0..count {
                let name = message::param_name(request, index)?;
                let value = store.get(name).cloned().ok_or(HalError::NotFound)?;
                message::push_param(reply, HalParam::new(name, value))?;
            }
            Ok(())
        })
        .expect("getParameters registration");

    let set_store = Arc::clone(store);
    server
        .register_action(action::SET_PARAMETERS, move |request, count, reply| {
            let mut store = set_store.lock().unwrap();
            for index in 0..count {
                let param = message::typed_param(request, index)?;
                store.insert(param.name, param.value);
            }
            message::set_result_status(reply, Status::Success);
            Ok(())
        })
        .expect("setParameters registration");

    let delete_store = Arc::clone(store);
    server
        .register_action(action::DELETE_OBJECT, move |request, count, reply| {
            let mut store = delete_store.lock().unwrap();
            for index in 0..count {
                let name = message::param_name(request, index)?;
                store.remove(name).ok_or(HalError::NotFound)?;
            }
            message::set_result_status(reply, Status::Success);
            Ok(())
        })
        .expect("deleteObject registration");

    let schema_path = server.config().schema_path.clone();
    server
        .register_action(action::GET_SCHEMA, move |_, _, reply| {
            message::set_schema_path(reply, &schema_path)
        })
        .expect("getSchema registration");

    server
        .register_action(action::SUBSCRIBE_EVENT, |_, _, reply| {
            message::set_result_status(reply, Status::Success);
            Ok(())
        })
        .expect("subscribeEvent registration");
}

/// Flips the simulated link states and publishes the change on every round.
fn event_loop(server: HalServer, store: ParamStore, log: logging::Logger) {
    let mut link_up = true;
    loop {
        thread::sleep(EVENT_INTERVAL);
        link_up = !link_up;
        let dsl_status = if link_up { "Up" } else { "Down" };
        let eth_status = if link_up { "Down" } else { "Up" };

        {
            let mut store = store.lock().unwrap();
            store.insert(DSL_LINK_EVENT.to_owned(), ParamValue::Str(dsl_status.to_owned()));
            store.insert(ETH_LINK_EVENT.to_owned(), ParamValue::Str(eth_status.to_owned()));
        }

        if let Err(err) = server.publish_event(DSL_LINK_EVENT, dsl_status) {
            logging::error!(log, "publish failed"; "event" => DSL_LINK_EVENT, "error" => %err);
        }
        if let Err(err) = server.publish_event(ETH_LINK_EVENT, eth_status) {
            logging::error!(log, "publish failed"; "event" => ETH_LINK_EVENT, "error" => %err);
        }
    }
}

pub fn main() {
    let matches = App::new("HAL Simulator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs a simulated vendor HAL server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();

    let logger = logging::init();

    let server = HalServer::init(config_file_path, &logger).expect("server initialisation failed");
    let store = seed_store();
    register_handlers(&server, &store);

    server.run().expect("failed to start the server thread");
    logging::info!(logger, "hal simulator running"; "port" => server.config().port);

    event_loop(server, store, logger);
}
