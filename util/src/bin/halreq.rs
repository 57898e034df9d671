//! Sends one request to a running HAL server and prints the reply.
//!
//! The request file supplies the action and the params array; the header
//! (module, version, reqId) is minted fresh from the configuration.

use std::fs;
use std::process;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};

use halbus::logging;
use halbus::message::{result_status, Envelope};
use halbus::HalClient;

const CONNECT_ATTEMPTS: u32 = 50;

fn main() {
    let matches = App::new("halreq")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Sends a single request to a HAL server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .arg(
            Arg::with_name("REQUEST_FILE")
                .help("Path to a json file with the request action and params")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let request_file_path = matches.value_of("REQUEST_FILE").unwrap();

    let logger = logging::init();

    let template: Envelope = match fs::read(request_file_path)
        .map_err(|err| err.to_string())
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| err.to_string()))
    {
        Ok(template) => template,
        Err(err) => {
            logging::error!(logger, "cannot read request file";
                            "path" => request_file_path,
                            "error" => err);
            process::exit(1);
        }
    };
    let action_name = match template.action() {
        Some(action_name) => action_name.to_owned(),
        None => {
            logging::error!(logger, "request file has no action"; "path" => request_file_path);
            process::exit(1);
        }
    };

    let client = HalClient::init(config_file_path, &logger).unwrap_or_else(|err| {
        logging::error!(logger, "client initialisation failed"; "error" => %err);
        process::exit(1);
    });
    client.run().expect("failed to start the client thread");

    let mut attempts = CONNECT_ATTEMPTS;
    while !client.is_connected() {
        if attempts == 0 {
            logging::error!(logger, "could not connect to server"; "port" => client.config().port);
            process::exit(1);
        }
        attempts -= 1;
        thread::sleep(Duration::from_millis(100));
    }

    // Fresh header, params from the file.
    let mut request = client.request_header(&action_name);
    if let Some(params) = template.params {
        request.params = Some(params);
    }

    match client.send_and_wait(&request) {
        Ok(reply) => {
            println!("{}", String::from_utf8_lossy(&reply.to_wire()));
            match result_status(&reply) {
                Some(status) => logging::info!(logger, "request finished"; "status" => status.as_str()),
                None => logging::info!(logger, "request finished"; "status" => "n/a"),
            }
        }
        Err(err) => {
            logging::error!(logger, "request failed"; "error" => %err);
            client.terminate().ok();
            process::exit(1);
        }
    }

    client.terminate().ok();
}
