//! Server reply decoding.
//!
//! A reply is a run of CR-terminated segments: a status line, a summary line,
//! then zero or more directives. Text after the last CR is not a segment.

use heapless::Vec as HeaplessVec;
use winnow::combinator::terminated;
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::take_till;

/// Segment terminator.
pub const SEGMENT_TERMINATOR: char = '\r';

/// Leading segments (status line and summary) that never carry directives.
pub const SUMMARY_SEGMENTS: usize = 2;

/// Directives retained per reply.
pub const MAX_DIRECTIVES: usize = 8;

/// Number of leading characters compared against a directive keyword.
pub const KEYWORD_LEN: usize = 6;

const REBOOT_KEYWORD: &str = "REBOOT";
const SETCMD_KEYWORD: &str = "SETCMD";

/// Command issued by the server inside a reply.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Directive<'a> {
    Reboot,
    /// Opaque configuration payload.
    SetConfig(&'a str),
}

pub type Directives<'a> = HeaplessVec<Directive<'a>, MAX_DIRECTIVES>;

/// Decoded server reply.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerReply<'a> {
    /// Status line began with `OK`.
    pub accepted: bool,
    pub status: Option<&'a str>,
    pub summary: Option<&'a str>,
    pub directives: Directives<'a>,
    /// A `REBOOT` appeared anywhere in the reply, stored or not.
    pub reboot: bool,
    /// Directives past [`MAX_DIRECTIVES`] that were not stored.
    pub dropped: usize,
}

impl<'a> ServerReply<'a> {
    fn record(&mut self, directive: Directive<'a>) {
        if directive == Directive::Reboot {
            self.reboot = true;
        }
        if self.directives.push(directive).is_err() {
            self.dropped += 1;
        }
    }
}

fn segment<'a>() -> impl Parser<&'a str, &'a str, ContextError> {
    move |input: &mut &'a str| {
        terminated(take_till(0.., SEGMENT_TERMINATOR), SEGMENT_TERMINATOR).parse_next(input)
    }
}

/// Iterates over complete segments of `body`.
pub fn segments(body: &str) -> impl Iterator<Item = &str> {
    let mut rest = body;
    core::iter::from_fn(move || segment().parse_next(&mut rest).ok())
}

/// Matches one segment against the directive keywords.
#[must_use]
pub fn classify(segment: &str) -> Option<Directive<'_>> {
    let keyword = segment.get(..KEYWORD_LEN)?;
    match keyword {
        REBOOT_KEYWORD => Some(Directive::Reboot),
        SETCMD_KEYWORD => {
            let rest = &segment[KEYWORD_LEN..];
            Some(Directive::SetConfig(rest.strip_prefix(' ').unwrap_or(rest)))
        }
        _ => None,
    }
}

/// Directives carried by `body`, in order of appearance.
#[must_use]
pub fn parse_directives(body: &str) -> Directives<'_> {
    parse_reply(body).directives
}

/// Decodes the status, summary and directives of a reply.
///
/// Every segment is scanned; storage overflow only drops directives from
/// [`ServerReply::directives`], never the reboot flag.
#[must_use]
pub fn parse_reply(body: &str) -> ServerReply<'_> {
    let mut lines = segments(body);
    let mut leading = lines.by_ref().take(SUMMARY_SEGMENTS);
    let status = leading.next();
    let summary = leading.next();

    let mut reply = ServerReply {
        accepted: status.is_some_and(|line| line.starts_with("OK")),
        status,
        summary,
        ..ServerReply::default()
    };
    for directive in lines.filter_map(classify) {
        reply.record(directive);
    }
    if reply.dropped > 0 {
        warn!(
            "directives: dropped {} past max={}",
            reply.dropped, MAX_DIRECTIVES
        );
    }
    reply
}
