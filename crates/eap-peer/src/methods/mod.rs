//! Secondary EAP methods run inside the EAP-TTLS tunnel

mod gtc;
mod md5;
mod mschapv2;

pub use gtc::GtcMethod;
pub use md5::Md5Method;
pub use mschapv2::MsChapV2Method;

use crate::status::{ClientStatus, Step};
use eap_proto::{EapCode, EapPacket};

/// Shared handling of the Success and Failure packets that end a method
///
/// Success counts only once the method has answered a request.
pub(crate) fn finish(packet: &EapPacket, answered: bool) -> Option<Step> {
    match packet.code {
        EapCode::Success if answered => Some(Step::success(None)),
        EapCode::Success | EapCode::Failure => Some(Step::failure(None, ClientStatus::Failed)),
        _ => None,
    }
}
