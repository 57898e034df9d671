//! Inbound request routing: frames a receive buffer, maps each envelope's
//! action to its registered handler, and converts the outcome into the reply
//! the peer expects.

use crate::framing::{Frame, Framer};
use crate::logging;
use crate::message::{self, action, Envelope, NotificationMode, ReqId, Status};
use crate::shared::HalResult;

use super::{ConnId, ServerCore};

pub(crate) fn process_buffer(core: &ServerCore, conn: ConnId, framer: &mut Framer, chunk: &[u8]) {
    let (frames, err) = framer.push(chunk);
    if let Some(err) = err {
        logging::error!(core.log, "dropping rest of receive buffer";
                        "context" => "process_buffer",
                        "conn" => conn,
                        "error" => %err);
    }
    for frame in frames {
        process_frame(core, conn, &frame);
    }
}

fn process_frame(core: &ServerCore, conn: ConnId, frame: &Frame) {
    let envelope = match Envelope::from_value(&frame.value) {
        Ok(envelope) => envelope,
        Err(err) => {
            logging::error!(core.log, "discarding undecodable request";
                            "context" => "process_frame",
                            "conn" => conn,
                            "error" => %err);
            return;
        }
    };

    // A request without an id or an action cannot be answered; drop it.
    let req_id = match envelope.req_id() {
        Some(req_id) => req_id.clone(),
        None => {
            logging::error!(core.log, "request without reqId"; "conn" => conn);
            return;
        }
    };
    let action_name = match envelope.action() {
        Some(action_name) => action_name.to_owned(),
        None => {
            logging::error!(core.log, "request without action"; "conn" => conn);
            return;
        }
    };

    let handlers = core.handlers.read().unwrap();
    match handlers.get(&action_name) {
        Some(handler) => {
            invoke_handler(core, conn, &envelope, &action_name, &req_id, handler.as_ref())
        }
        None if action_name == action::RESULT => {
            core.subscriptions.handle_ack(conn, &envelope);
        }
        None => {
            logging::info!(core.log, "action not supported";
                           "conn" => conn,
                           "action" => action_name.as_str());
            send_status(core, conn, &req_id, Status::NotSupported);
        }
    }
}

fn invoke_handler(
    core: &ServerCore,
    conn: ConnId,
    request: &Envelope,
    action_name: &str,
    req_id: &ReqId,
    handler: &(dyn Fn(&Envelope, usize, &mut Envelope) -> HalResult<()> + Send + Sync),
) {
    let mut reply = message::reply_skeleton(
        &core.config.module_name,
        &core.config.module_version,
        action_name,
        req_id,
    );

    match handler(request, request.param_count(), &mut reply) {
        Ok(()) => {
            let reply_bytes = reply.to_wire();
            if !core.validate_reply(&reply_bytes) {
                logging::error!(core.log, "reply rejected by schema";
                                "conn" => conn,
                                "action" => action_name);
                send_status(core, conn, req_id, Status::NotSupported);
                return;
            }

            if core.send_to(conn, &reply_bytes).is_err() {
                logging::error!(core.log, "failed to send reply";
                                "conn" => conn,
                                "action" => action_name);
            }

            if action_name == action::SUBSCRIBE_EVENT {
                register_subscription(core, conn, request);
            }
        }
        Err(err) => {
            logging::error!(core.log, "handler failed";
                            "conn" => conn,
                            "action" => action_name,
                            "error" => %err);
            send_status(core, conn, req_id, Status::Failed);
        }
    }
}

/// Records the subscription carried by a successfully handled
/// `subscribeEvent` request.
fn register_subscription(core: &ServerCore, conn: ConnId, request: &Envelope) {
    match message::subscribe_request(request, 0) {
        Ok(subscribe) => {
            let mode = subscribe.mode.unwrap_or_else(|| {
                logging::warn!(core.log, "unknown notification type, using onChange";
                               "conn" => conn,
                               "notification_type" => subscribe.raw_mode.as_str());
                NotificationMode::OnChange
            });
            core.subscriptions.add(conn, &subscribe.name, mode);
        }
        Err(err) => {
            logging::error!(core.log, "malformed subscription request";
                            "conn" => conn,
                            "error" => %err);
        }
    }
}

fn send_status(core: &ServerCore, conn: ConnId, req_id: &ReqId, status: Status) {
    let reply = message::status_reply(
        &core.config.module_name,
        &core.config.module_version,
        req_id,
        status,
    );
    if core.send_to(conn, &reply.to_wire()).is_err() {
        logging::error!(core.log, "failed to send status reply"; "conn" => conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HalConfig;
    use crate::message::{result_status, HalParam, ParamValue};
    use crate::server::HalServer;
    use crate::shared::HalError;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn test_config() -> HalConfig {
        HalConfig {
            module_name: "DSLHAL".to_owned(),
            module_version: "0.2".to_owned(),
            schema_path: "/tmp/schema.json".to_owned(),
            port: 0,
            request_timeout: Duration::from_micros(2000),
        }
    }

    /// Server facade plus a socket pair standing in for one accepted
    /// connection: replies sent to conn 1 land on the returned reader.
    fn harness() -> (HalServer, TcpStream) {
        let server = HalServer::init_with_config(test_config(), None);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = TcpStream::connect(addr).unwrap();
        let (reader, _) = listener.accept().unwrap();
        reader
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        server.core.install_writer(1, writer);
        (server, reader)
    }

    fn feed(server: &HalServer, request: &Envelope) {
        let mut framer = Framer::new();
        process_buffer(&server.core, 1, &mut framer, &request.to_wire());
    }

    fn read_reply(reader: &mut TcpStream) -> Envelope {
        let mut buffer = [0u8; 4096];
        let count = reader.read(&mut buffer).unwrap();
        let mut framer = Framer::new();
        let (frames, err) = framer.push(&buffer[..count]);
        assert!(err.is_none());
        assert_eq!(frames.len(), 1);
        Envelope::from_value(&frames[0].value).unwrap()
    }

    fn request(action_name: &str, sequence: u32) -> Envelope {
        message::request_header("DSLHAL", "0.2", action_name, sequence)
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let (server, _reader) = harness();

        server
            .register_action(action::SET_PARAMETERS, |_, _, _| Ok(()))
            .unwrap();
        let second = server.register_action(action::SET_PARAMETERS, |_, _, _| Ok(()));

        assert_eq!(
            second,
            Err(HalError::AlreadyRegistered(action::SET_PARAMETERS.to_owned()))
        );
    }

    #[test]
    fn test_handler_reply_carries_request_id() {
        let (server, mut reader) = harness();
        server
            .register_action(action::SET_PARAMETERS, |_, _, reply| {
                message::set_result_status(reply, Status::Success);
                Ok(())
            })
            .unwrap();

        let request = request(action::SET_PARAMETERS, 1001);
        feed(&server, &request);

        let reply = read_reply(&mut reader);
        assert_eq!(reply.req_id, request.req_id);
        assert_eq!(reply.action(), Some(action::RESULT));
        assert_eq!(result_status(&reply), Some(Status::Success));
    }

    #[test]
    fn test_handler_sees_param_count() {
        let (server, mut reader) = harness();
        server
            .register_action(action::SET_PARAMETERS, |request, count, reply| {
                assert_eq!(count, request.param_count());
                assert_eq!(count, 2);
                message::set_result_status(reply, Status::Success);
                Ok(())
            })
            .unwrap();

        let mut request = request(action::SET_PARAMETERS, 1002);
        message::push_param(&mut request, HalParam::new("a", ParamValue::Int(1))).unwrap();
        message::push_param(&mut request, HalParam::new("b", ParamValue::Boolean(false))).unwrap();
        feed(&server, &request);

        assert_eq!(result_status(&read_reply(&mut reader)), Some(Status::Success));
    }

    #[test]
    fn test_unknown_action_gets_not_supported() {
        let (server, mut reader) = harness();

        feed(&server, &request("doSomething", 1003));

        let reply = read_reply(&mut reader);
        assert_eq!(result_status(&reply), Some(Status::NotSupported));
    }

    #[test]
    fn test_failing_handler_gets_failed_reply() {
        let (server, mut reader) = harness();
        server
            .register_action(action::DELETE_OBJECT, |_, _, _| {
                Err(HalError::InvalidArgument("no such object"))
            })
            .unwrap();

        feed(&server, &request(action::DELETE_OBJECT, 1004));

        assert_eq!(result_status(&read_reply(&mut reader)), Some(Status::Failed));
    }

    #[test]
    fn test_rejected_reply_becomes_not_supported() {
        let (server, mut reader) = harness();
        server.set_reply_validator(|_| false);
        server
            .register_action(action::SET_PARAMETERS, |_, _, reply| {
                message::set_result_status(reply, Status::Success);
                Ok(())
            })
            .unwrap();

        feed(&server, &request(action::SET_PARAMETERS, 1005));

        assert_eq!(
            result_status(&read_reply(&mut reader)),
            Some(Status::NotSupported)
        );
    }

    #[test]
    fn test_request_without_req_id_is_dropped() {
        let (server, mut reader) = harness();

        let mut framer = Framer::new();
        process_buffer(
            &server.core,
            1,
            &mut framer,
            br#"{"module": "DSLHAL", "version": "0.2", "action": "setParameters"}"#,
        );

        reader
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buffer = [0u8; 64];
        assert!(reader.read(&mut buffer).is_err());
    }

    #[test]
    fn test_subscribe_event_registers_subscription() {
        let (server, mut reader) = harness();
        server
            .register_action(action::SUBSCRIBE_EVENT, |_, _, reply| {
                message::set_result_status(reply, Status::Success);
                Ok(())
            })
            .unwrap();

        let mut request = request(action::SUBSCRIBE_EVENT, 1006);
        let mut param = message::Param::named("Device.DSL.Line.1.LinkStatus");
        param.notification_type = Some("onChangeSync".to_owned());
        request.params.as_mut().unwrap().push(param);
        feed(&server, &request);

        assert_eq!(result_status(&read_reply(&mut reader)), Some(Status::Success));
        assert_eq!(
            server.core.subscriptions.count_for("Device.DSL.Line.1.LinkStatus"),
            1
        );
    }

    #[test]
    fn test_glued_requests_both_dispatch() {
        let (server, mut reader) = harness();
        server
            .register_action(action::SET_PARAMETERS, |_, _, reply| {
                message::set_result_status(reply, Status::Success);
                Ok(())
            })
            .unwrap();

        let mut glued = request(action::SET_PARAMETERS, 2001).to_wire();
        glued.extend_from_slice(&request(action::SET_PARAMETERS, 2002).to_wire());

        let mut framer = Framer::new();
        process_buffer(&server.core, 1, &mut framer, &glued);

        // Two replies, in request order.
        let mut collected = Vec::new();
        let mut buffer = [0u8; 8192];
        let mut reply_framer = Framer::new();
        while collected.len() < 2 {
            let count = reader.read(&mut buffer).unwrap();
            let (frames, err) = reply_framer.push(&buffer[..count]);
            assert!(err.is_none());
            collected.extend(frames);
        }
        let first = Envelope::from_value(&collected[0].value).unwrap();
        let second = Envelope::from_value(&collected[1].value).unwrap();
        assert_eq!(first.req_id.unwrap().canonical(), format!("{:08X}", 2001));
        assert_eq!(second.req_id.unwrap().canonical(), format!("{:08X}", 2002));
    }

    #[test]
    fn test_result_ack_routes_to_registry() {
        let (server, _reader) = harness();
        server
            .core
            .subscriptions
            .add(1, "Device.A", NotificationMode::OnChangeSync);
        server.core.subscriptions.entries.lock().unwrap()[0].last =
            crate::server::subscriptions::PublishState::Waiting("105".to_owned());

        let ack = message::event_ack("DSLHAL", "0.2", &ReqId::Number(105), "Device.A", Status::Success);
        feed(&server, &ack);

        assert_eq!(
            server.core.subscriptions.entries.lock().unwrap()[0].last,
            crate::server::subscriptions::PublishState::Success
        );
    }
}
