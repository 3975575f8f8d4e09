use crate::{Error, Result};
use rsip::{
    prelude::{HeadersExt, UntypedHeader},
    Request, Response,
};

pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod request;
pub mod server_dialog;
pub mod timer;

#[cfg(test)]
mod tests;

/// SIP Dialog Identifier
///
/// `DialogId` uniquely identifies a SIP dialog. According to RFC 3261 12, a
/// dialog is identified by the Call-ID, the local tag and the remote tag. The
/// identifier is fixed when the dialog is created and never changes.
///
/// # Examples
///
/// ```rust
/// use rsipdialog::dialog::DialogId;
///
/// let dialog_id = DialogId {
///     call_id: "1234567890@example.com".to_string(),
///     local_tag: "alice-tag-123".to_string(),
///     remote_tag: "bob-tag-456".to_string(),
/// };
///
/// assert_eq!(
///     dialog_id.to_string(),
///     "1234567890@example.com-alice-tag-123-bob-tag-456"
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

fn required_tag(tag: Option<String>, header: &str) -> Result<String> {
    match tag {
        Some(tag) if !tag.is_empty() => Ok(tag),
        _ => Err(Error::Error(format!("{} tag not found", header))),
    }
}

impl DialogId {
    /// Create a DialogId from a Request from the perspective of a UAS (receiver).
    /// The to-tag is the local tag and the from-tag is the remote tag.
    pub fn from_uas_request(request: &Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let local_tag = request.to_header()?.tag()?.map(|t| t.value().to_string());
        let remote_tag = request.from_header()?.tag()?.map(|t| t.value().to_string());

        Ok(DialogId {
            call_id,
            local_tag: required_tag(local_tag, "to")?,
            remote_tag: required_tag(remote_tag, "from")?,
        })
    }

    /// Create a DialogId from a Response from the perspective of a UAC.
    /// The from-tag is the local tag and the to-tag is the remote tag.
    pub fn from_uac_response(resp: &Response) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();
        let local_tag = resp.from_header()?.tag()?.map(|t| t.value().to_string());
        let remote_tag = resp.to_header()?.tag()?.map(|t| t.value().to_string());

        Ok(DialogId {
            call_id,
            local_tag: required_tag(local_tag, "from")?,
            remote_tag: required_tag(remote_tag, "to")?,
        })
    }

    /// Create a DialogId from a Response from the perspective of a UAS.
    /// The to-tag is the local tag and the from-tag is the remote tag.
    pub fn from_uas_response(resp: &Response) -> Result<Self> {
        let call_id = resp.call_id_header()?.value().to_string();
        let local_tag = resp.to_header()?.tag()?.map(|t| t.value().to_string());
        let remote_tag = resp.from_header()?.tag()?.map(|t| t.value().to_string());

        Ok(DialogId {
            call_id,
            local_tag: required_tag(local_tag, "to")?,
            remote_tag: required_tag(remote_tag, "from")?,
        })
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = crate::Error;

    /// Incoming in-dialog requests are seen from the UAS side.
    fn try_from(request: &Request) -> Result<Self> {
        Self::from_uas_request(request)
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = crate::Error;

    /// Incoming responses are seen from the UAC side.
    fn try_from(resp: &Response) -> Result<Self> {
        Self::from_uac_response(resp)
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
