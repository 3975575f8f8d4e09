//! In-dialog request and response construction (RFC 3261 12.2.1.1)
use super::dialog::{DialogCore, DialogInner};
use crate::{
    rsip_ext::{
        replace_header, strip_request_uri_params, RAck, Refresher, RouteEntry, SessionExpires,
        HEADER_MIN_SE, HEADER_RACK,
    },
    Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    typed::CSeq,
    Header, Headers, Method, Param, Request, Response, StatusCode,
};
use tracing::info;

impl DialogInner {
    /// Where a client transaction for `request` goes first (RFC 3261 8.1.2):
    /// a loose-routing first route, otherwise the Request-URI, which holds
    /// the strict router when there is one.
    pub(super) fn next_hop(&self, request: &Request) -> rsip::Uri {
        match self.route_set.first() {
            Some(first) if first.is_loose() => first.uri().clone(),
            _ => request.uri.clone(),
        }
    }

    /// Request-URI and Route entries for a request sent to `remote_target`.
    ///
    /// A strict router as first hop becomes the Request-URI, and the remote
    /// target moves to the end of the Route list.
    pub(super) fn request_target(&self, remote_target: &rsip::Uri) -> (rsip::Uri, Vec<RouteEntry>) {
        match self.route_set.first() {
            None => (remote_target.clone(), vec![]),
            Some(first) if first.is_loose() => (remote_target.clone(), self.route_set.clone()),
            Some(first) => {
                let mut routes = self.route_set[1..].to_vec();
                routes.push(RouteEntry::from(remote_target.clone()));
                (strip_request_uri_params(first.uri()), routes)
            }
        }
    }

    pub(super) fn local_contact(&self) -> String {
        let scheme = if self.is_secure { "sips" } else { "sip" };
        match self.local_uri.auth.as_ref() {
            Some(auth) => format!("{}:{}@{}", scheme, auth.user, self.option.contact_host),
            None => format!("{}:{}", scheme, self.option.contact_host),
        }
    }

    pub(super) fn make_request(
        &self,
        core: &mut DialogCore,
        method: Method,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        self.make_request_with_vias(core, method, None, vec![], headers, body)
    }

    /// `cseq` overrides the local sequence number; without it every method
    /// but ACK takes the next one.
    pub(super) fn make_request_with_vias(
        &self,
        core: &mut DialogCore,
        method: Method,
        cseq: Option<u32>,
        vias: Vec<rsip::headers::Via>,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let seq = match cseq {
            Some(seq) => seq,
            None if method == Method::Ack => core.local_seq,
            None => {
                core.local_seq += 1;
                core.local_seq
            }
        };
        let (uri, routes) = self.request_target(&core.remote_target);

        let mut all = Headers::default();
        for via in vias {
            all.push(Header::Via(via));
        }
        all.push(Header::CallId(self.id.call_id.clone().into()));
        all.push(Header::From(
            format!("<{}>;tag={}", self.local_uri, self.id.local_tag).into(),
        ));
        all.push(Header::To(
            format!("<{}>;tag={}", self.remote_uri, self.id.remote_tag).into(),
        ));
        all.push(Header::CSeq(
            CSeq {
                seq,
                method: method.clone(),
            }
            .into(),
        ));
        all.extend(routes.iter().map(RouteEntry::to_header).collect());
        all.push(Header::Contact(format!("<{}>", self.local_contact()).into()));
        if !matches!(method, Method::Ack | Method::Bye) {
            all.push(Header::Allow(self.option.allow.clone().into()));
        }
        if method != Method::Ack {
            all.push(Header::Supported(self.option.supported.clone().into()));
        }
        all.push(Header::MaxForwards(70.into()));
        if matches!(method, Method::Invite | Method::Update) {
            all.push(SessionExpires::new(self.option.session_expires, Some(Refresher::Uac)).to_header());
            all.push(Header::Other(
                HEADER_MIN_SE.into(),
                self.option.min_session_expires.to_string().into(),
            ));
        }
        if let Some(user_agent) = &self.option.user_agent {
            all.push(Header::UserAgent(user_agent.clone().into()));
        }
        for header in headers {
            replace_header(&mut all, header);
        }
        let body = body.unwrap_or_default();
        all.push(Header::ContentLength((body.len() as u32).into()));

        Ok(Request {
            method,
            uri,
            headers: all,
            body,
            version: rsip::Version::V2,
        })
    }

    /// ACK for a 2xx to `invite`: same CSeq number and top Via, and the
    /// INVITE's credentials.
    pub(super) fn make_ack(&self, core: &mut DialogCore, invite: &Request) -> Result<Request> {
        let cseq = invite.cseq_header()?.seq()?;
        let via = invite.via_header()?.clone();
        let credentials = invite
            .headers
            .iter()
            .filter(|h| matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_)))
            .cloned()
            .collect();
        self.make_request_with_vias(core, Method::Ack, Some(cseq), vec![via], credentials, None)
    }

    /// PRACK for a reliable provisional response carrying `rseq`.
    pub(super) fn make_prack(
        &self,
        core: &mut DialogCore,
        response: &Response,
        rseq: u32,
    ) -> Result<Request> {
        let cseq = response.cseq_header()?;
        let rack = RAck {
            rseq,
            cseq: cseq.seq()?,
            method: cseq.method()?.to_string(),
        };
        self.make_request(
            core,
            Method::PRack,
            vec![Header::Other(HEADER_RACK.into(), rack.to_string().into())],
            None,
        )
    }

    /// Response to an in-dialog request, with this side's tag added to To.
    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = Headers::default();
        for header in request.headers.iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    resp_headers.push(header.clone());
                }
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!(error = %e, "error parsing to header");
                            continue;
                        }
                    };
                    if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                        to.params
                            .push(Param::Tag(self.id.local_tag.clone().into()));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                _ => {}
            }
        }
        resp_headers.push(Header::Contact(format!("<{}>", self.local_contact()).into()));
        if let Some(user_agent) = &self.option.user_agent {
            resp_headers.push(Header::UserAgent(user_agent.clone().into()));
        }
        for header in headers {
            replace_header(&mut resp_headers, header);
        }
        let body = body.unwrap_or_default();
        resp_headers.push(Header::ContentLength((body.len() as u32).into()));

        Response {
            status_code: status,
            headers: resp_headers,
            body,
            version: rsip::Version::V2,
        }
    }
}
