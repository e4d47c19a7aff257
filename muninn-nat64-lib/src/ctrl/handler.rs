//! Request dispatch into the instance registry.
//!
//! One request, one response; listings page through offsets. Nothing in
//! here ever hands out internal state, only serialized snapshots.

use std::sync::Arc;

use tracing::warn;

use super::message::{Request, RequestOp, Response, ResponsePayload, MAGIC};
use crate::config::GlobalConfig;
use crate::error::{Nat64Error, Result};
use crate::hooks::{Egress, Router};
use crate::instance::{InstanceRegistry, Xlator};

/// Entries per multipart page.
const PAGE: usize = 64;

pub struct CtrlHandler {
    registry: Arc<InstanceRegistry>,
    egress: Arc<dyn Egress>,
    router: Arc<dyn Router>,
}

impl CtrlHandler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        egress: Arc<dyn Egress>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self { registry, egress, router }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn handle(&self, request: &Request) -> Response {
        if request.header.magic != MAGIC {
            warn!("control request with a bad magic");
            return Response::err(&Nat64Error::Message("bad magic".into()));
        }
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => Response::err(&e),
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        let name = request.header.instance.as_str();

        match &request.op {
            RequestOp::InstanceAdd { pool6 } => {
                let config = GlobalConfig { pool6: Some(*pool6), ..GlobalConfig::default() };
                let xlator =
                    Xlator::new(name, config, self.egress.clone(), self.router.clone());
                self.registry.add(request.header.xlator_type, xlator)?;
                Ok(done(ResponsePayload::None))
            }
            RequestOp::InstanceRm => {
                self.registry.rm(name)?;
                Ok(done(ResponsePayload::None))
            }
            RequestOp::InstanceFlush => {
                self.registry.flush();
                Ok(done(ResponsePayload::None))
            }
            RequestOp::InstanceForeach => {
                let list = self.registry.foreach();
                Ok(done(ResponsePayload::Instances { list }))
            }
            RequestOp::InstanceHello => {
                let exists = self.registry.hello(name);
                Ok(done(ResponsePayload::Hello { exists }))
            }

            RequestOp::Pool4Add { sample } => {
                let xlator = self.instance(name)?;
                xlator.pool4.add(*sample);
                Ok(done(ResponsePayload::None))
            }
            RequestOp::Pool4Rm { sample } => {
                let xlator = self.instance(name)?;
                xlator.pool4.rm(*sample);
                // Bindings masked from the removed slice are now lies.
                xlator.bib.delete_taddr4s(sample.proto, sample.prefix, Some(sample.ports));
                Ok(done(ResponsePayload::None))
            }
            RequestOp::Pool4Flush => {
                let xlator = self.instance(name)?;
                xlator.pool4.flush();
                xlator.bib.flush();
                Ok(done(ResponsePayload::None))
            }
            RequestOp::Pool4Foreach { offset } => {
                let xlator = self.instance(name)?;
                let samples = xlator.pool4.foreach(*offset, PAGE);
                let is_done = samples.len() < PAGE;
                Ok(page(ResponsePayload::Pool4 { samples }, is_done))
            }

            RequestOp::BibAddStatic { proto, v6, v4 } => {
                let xlator = self.instance(name)?;
                if !xlator.pool4.contains(*proto, *v4) {
                    return Err(Nat64Error::Invalid(format!(
                        "{v4} does not belong to pool4"
                    )));
                }
                xlator.bib.add_static(*proto, *v6, *v4)?;
                Ok(done(ResponsePayload::None))
            }
            RequestOp::BibRm { proto, v4 } => {
                let xlator = self.instance(name)?;
                xlator.bib.rm_entry(*proto, *v4)?;
                Ok(done(ResponsePayload::None))
            }
            RequestOp::BibForeach { proto, offset } => {
                let xlator = self.instance(name)?;
                let entries = xlator.bib.foreach_bib(*proto, *offset, PAGE);
                let is_done = entries.len() < PAGE;
                Ok(page(ResponsePayload::Bib { entries }, is_done))
            }

            RequestOp::EamtAdd { .. }
            | RequestOp::EamtRm { .. }
            | RequestOp::EamtFlush
            | RequestOp::EamtForeach => Err(Nat64Error::StatefulOnly("EAMT")),

            RequestOp::SessionForeach { proto, offset } => {
                let xlator = self.instance(name)?;
                let timeouts = xlator.config.load().timeouts.clone();
                let sessions = xlator.bib.foreach_session(*proto, *offset, PAGE, &timeouts);
                let is_done = sessions.len() < PAGE;
                Ok(page(ResponsePayload::Sessions { sessions }, is_done))
            }

            RequestOp::GlobalGet => {
                let xlator = self.instance(name)?;
                let config = xlator.config.load_full();
                Ok(done(ResponsePayload::Global { config: Box::new((*config).clone()) }))
            }
            RequestOp::GlobalSet { mask, values } => {
                let xlator = self.instance(name)?;
                xlator.set_global(*mask, values)?;
                Ok(done(ResponsePayload::None))
            }
        }
    }

    fn instance(&self, name: &str) -> Result<Arc<Xlator>> {
        self.registry
            .get(name)
            .ok_or_else(|| Nat64Error::NotFound(format!("instance '{name}'")))
    }
}

fn done(payload: ResponsePayload) -> Response {
    Response::ok(payload, true)
}

fn page(payload: ResponsePayload, is_done: bool) -> Response {
    Response::ok(payload, is_done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::message::{RequestHeader, MAGIC};
    use crate::pool4::Pool4Sample;
    use crate::hooks::{RecordingEgress, StaticRouter};
    use crate::instance::XlatorKind;
    use crate::types::{L4Proto, PortRange, TransportAddr4, TransportAddr6};

    fn handler() -> CtrlHandler {
        CtrlHandler::new(
            Arc::new(InstanceRegistry::new()),
            Arc::new(RecordingEgress::new()),
            Arc::new(StaticRouter::default()),
        )
    }

    fn request(name: &str, op: RequestOp) -> Request {
        Request { header: RequestHeader::new(XlatorKind::Nat64, name), op }
    }

    fn sample() -> Pool4Sample {
        Pool4Sample {
            mark: 0,
            proto: L4Proto::Udp,
            prefix: "198.51.100.1/32".parse().unwrap(),
            ports: PortRange::new(40000, 40001),
        }
    }

    #[test]
    fn instance_lifecycle_over_messages() {
        let h = handler();
        let add = request("default", RequestOp::InstanceAdd {
            pool6: "64:ff9b::/96".parse().unwrap(),
        });
        assert!(h.handle(&add).is_ok());
        assert!(!h.handle(&add).is_ok(), "second add must collide");

        let hello = h.handle(&request("default", RequestOp::InstanceHello));
        assert!(matches!(hello.payload, ResponsePayload::Hello { exists: true }));

        assert!(h.handle(&request("default", RequestOp::InstanceRm)).is_ok());
        let hello = h.handle(&request("default", RequestOp::InstanceHello));
        assert!(matches!(hello.payload, ResponsePayload::Hello { exists: false }));
    }

    #[test]
    fn bad_magic_is_refused() {
        let h = handler();
        let mut req = request("default", RequestOp::InstanceHello);
        req.header.magic = *b"NOPE";
        assert!(!h.handle(&req).is_ok());
        assert_ne!(req.header.magic, MAGIC);
    }

    #[test]
    fn eamt_is_somebody_elses_job() {
        let h = handler();
        let response = h.handle(&request("default", RequestOp::EamtFlush));
        assert_eq!(response.status, 95);
    }

    #[test]
    fn static_bib_requires_pool4_membership() {
        let h = handler();
        h.handle(&request("x", RequestOp::InstanceAdd {
            pool6: "64:ff9b::/96".parse().unwrap(),
        }));

        let add = request("x", RequestOp::BibAddStatic {
            proto: L4Proto::Udp,
            v6: TransportAddr6::new("2001:db8::1".parse().unwrap(), 9000),
            v4: TransportAddr4::new("198.51.100.1".parse().unwrap(), 40000),
        });
        assert!(!h.handle(&add).is_ok(), "no pool4 yet");

        h.handle(&request("x", RequestOp::Pool4Add { sample: sample() }));
        assert!(h.handle(&add).is_ok());

        let list = h.handle(&request("x", RequestOp::BibForeach {
            proto: L4Proto::Udp,
            offset: None,
        }));
        assert!(list.is_done());
        match list.payload {
            ResponsePayload::Bib { entries } => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].is_static);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn global_set_round_trips() {
        let h = handler();
        h.handle(&request("g", RequestOp::InstanceAdd {
            pool6: "64:ff9b::/96".parse().unwrap(),
        }));

        let mut values = GlobalConfig::default();
        values.timeouts.udp_secs = 42;
        let set = request("g", RequestOp::GlobalSet {
            mask: crate::config::field::TIMEOUT_UDP,
            values: Box::new(values),
        });
        assert!(h.handle(&set).is_ok());

        let get = h.handle(&request("g", RequestOp::GlobalGet));
        match get.payload {
            ResponsePayload::Global { config } => assert_eq!(config.timeouts.udp_secs, 42),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
