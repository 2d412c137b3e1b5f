use std::sync::Arc;

use hickory_client::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_server::{
    authority::MessageResponseBuilder,
    proto::op::Message,
    server::{Request, RequestHandler, ResponseHandler, ResponseInfo},
};
use tracing::instrument;

use crate::engine::{Decision, Engine, EngineError};

fn serve_failed() -> ResponseInfo {
    let mut header = Header::new();
    header.set_response_code(ResponseCode::ServFail);
    header.into()
}

/// Rebuilds an owned [`Message`] from the parts `hickory_server::server::Request`
/// exposes, so the engine can work with the same type whether it's being
/// driven by the server or a co-located plugin.
fn request_message(request: &Request) -> Message {
    let mut message = Message::new();
    message.set_id(request.id());
    message.set_message_type(request.message_type());
    message.set_op_code(request.op_code());
    message.add_query(request.query().original().clone());
    for record in request.additionals() {
        message.add_additional(record.clone());
    }
    message
}

#[derive(Clone)]
pub(crate) struct Handler {
    pub(crate) engine: Arc<Engine>,
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    #[instrument(fields(
        request.id = request.id(),
        request.protocol = %request.request_info().protocol,
        request.source_address = %request.request_info().src.ip(),
        request.source_port = %request.request_info().src.port(),
    ), skip_all)]
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let mut builder = MessageResponseBuilder::from_message_request(request);

        if let Some(req_edns) = request.edns() {
            let mut resp_edns = Edns::new();

            let our_version = 0;
            resp_edns.set_dnssec_ok(false);
            resp_edns.set_max_payload(req_edns.max_payload().max(512));
            resp_edns.set_version(our_version);
            builder.edns(resp_edns);

            if req_edns.version() > our_version {
                tracing::warn!(
                    request_version = req_edns.version(),
                    current_version = our_version,
                    "invalid request edns version",
                );

                let result = response_handle
                    .send_response(builder.error_msg(request.header(), ResponseCode::BADVERS))
                    .await;

                return match result {
                    Err(e) => {
                        tracing::error!(error = %e, "request error");
                        serve_failed()
                    }
                    Ok(info) => info,
                };
            }
        }

        let result = match request.message_type() {
            MessageType::Query => match request.op_code() {
                OpCode::Query => self.answer(request, &mut builder, &mut response_handle).await,
                c => {
                    tracing::warn!(op_code = ?c, "unimplemented op_code");
                    response_handle
                        .send_response(builder.error_msg(request.header(), ResponseCode::NotImp))
                        .await
                }
            },
            MessageType::Response => {
                tracing::warn!("got a response as a request");
                response_handle
                    .send_response(builder.error_msg(request.header(), ResponseCode::FormErr))
                    .await
            }
        };

        match result {
            Err(e) => {
                tracing::error!(error = %e, "request failed");
                serve_failed()
            }
            Ok(info) => info,
        }
    }
}

impl Handler {
    async fn answer<R: ResponseHandler>(
        &self,
        request: &Request,
        builder: &mut MessageResponseBuilder<'_>,
        response_handle: &mut R,
    ) -> std::io::Result<ResponseInfo> {
        let message = request_message(request);

        match self.engine.resolve(&message).await {
            Ok(Decision::Answer(response)) => {
                let mut header = Header::response_from_request(request.header());
                header.set_authoritative(response.header().authoritative());
                header.set_recursion_available(true);
                header.set_response_code(response.header().response_code());

                response_handle
                    .send_response(builder.build(
                        header,
                        response.answers(),
                        response.name_servers(),
                        &None,
                        response.additionals(),
                    ))
                    .await
            }
            Ok(Decision::Yield) => {
                response_handle
                    .send_response(builder.error_msg(request.header(), ResponseCode::Refused))
                    .await
            }
            Err(EngineError::FormErr) => {
                response_handle
                    .send_response(builder.error_msg(request.header(), ResponseCode::FormErr))
                    .await
            }
            Err(e) => {
                tracing::warn!(error = %e, "engine failed to resolve request");
                response_handle
                    .send_response(builder.error_msg(request.header(), ResponseCode::ServFail))
                    .await
            }
        }
    }
}
