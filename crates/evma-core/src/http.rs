//! HTTP request/response line and header parser
//!
//! The concrete worked example of the [`Parser`](crate::parser::Parser)
//! contract: a table-driven finite-state machine over character classes.
//! Token bytes are compacted in place at the front of the input buffer (the
//! write cursor always trails the read cursor), so a decode spanning many
//! reads needs no side allocations until a token completes.
//!
//! Conventions:
//! - header field names are folded to lowercase;
//! - header values spanning a line fold (CRLF + whitespace) are rejoined
//!   with a single inserted space, as are runs of in-line whitespace;
//! - numeric status codes are accumulated digit by digit;
//! - any invalid state/class combination aborts with a structural
//!   "parse error", distinct from I/O errors;
//! - a token that would grow past the buffer capacity aborts with
//!   "out of buffer space".

use std::collections::BTreeMap;

use crate::buffer::{InputBuf, INPUTBUF_SIZE};
use crate::parser::{ParseError, ParseResult, ParseStatus, Parser};
use crate::parsers::STATE_SIZE_MAX;
use crate::value::Value;

// Character classes
const CTL: u8 = 0; // control characters
const LF: u8 = 1; // \n
const CR: u8 = 2; // \r
const LWS: u8 = 3; // space or \t
const TSP: u8 = 4; // tspecials
const SLH: u8 = 5; // /
const CLN: u8 = 6; // :
const DOT: u8 = 7; // .
const DIG: u8 = 8; // 0-9
const CH: u8 = 9; // H or h
const CT: u8 = 10; // T or t
const CP: u8 = 11; // P or p
const ETC: u8 = 12; // the rest
const CLASS_COUNT: usize = 13;

/// Maps the first 128 ASCII characters into character classes.
/// Characters above 127 are treated as `ETC`.
#[rustfmt::skip]
const ASCII_CLASS: [u8; 128] = [
    CTL, CTL, CTL, CTL, CTL, CTL, CTL, CTL,
    CTL, LWS, LF,  CTL, CTL, CR,  CTL, CTL,
    CTL, CTL, CTL, CTL, CTL, CTL, CTL, CTL,
    CTL, CTL, CTL, CTL, CTL, CTL, CTL, CTL,

    LWS, ETC, TSP, ETC, ETC, ETC, ETC, ETC,
    TSP, TSP, ETC, ETC, TSP, ETC, DOT, SLH,
    DIG, DIG, DIG, DIG, DIG, DIG, DIG, DIG,
    DIG, DIG, CLN, TSP, TSP, TSP, TSP, TSP,

    TSP, ETC, ETC, ETC, ETC, ETC, ETC, ETC,
    CH,  ETC, ETC, ETC, ETC, ETC, ETC, ETC,
    CP,  ETC, ETC, ETC, CT,  ETC, ETC, ETC,
    ETC, ETC, ETC, TSP, TSP, TSP, ETC, ETC,

    ETC, ETC, ETC, ETC, ETC, ETC, ETC, ETC,
    CH,  ETC, ETC, ETC, ETC, ETC, ETC, ETC,
    CP,  ETC, ETC, ETC, CT,  ETC, ETC, ETC,
    ETC, ETC, ETC, TSP, ETC, TSP, ETC, CTL,
];

// Request-line states
const R_GO: u8 = 0;
const R_METHOD: u8 = 1;
const R_MSP: u8 = 2;
const R_URI: u8 = 3;
const R_USP: u8 = 4;
const R_H: u8 = 5;
const R_HT: u8 = 6;
const R_HTT: u8 = 7;
const R_HTTP: u8 = 8;
const R_SLASH: u8 = 9;
const R_MAJOR: u8 = 10;
const R_DOT: u8 = 11;
const R_MINOR: u8 = 12;
// Status-line states
const S_GO: u8 = 13;
const S_H: u8 = 14;
const S_HT: u8 = 15;
const S_HTT: u8 = 16;
const S_HTTP: u8 = 17;
const S_SLASH: u8 = 18;
const S_MAJOR: u8 = 19;
const S_DOT: u8 = 20;
const S_MINOR: u8 = 21;
const S_SSP: u8 = 22;
const S_STATUS: u8 = 23;
const S_TSP: u8 = 24;
const S_TEXT: u8 = 25;
// Header states (shared)
const EOL_CR: u8 = 26;
const EOL_LF: u8 = 27;
const H_KEY: u8 = 28;
const H_COLON: u8 = 29;
const H_VALUE: u8 = 30;
const H_LWS: u8 = 31;
const H_ECR: u8 = 32;
const H_ECRLF: u8 = 33;
const V_CR: u8 = 34;
const V_CRLF: u8 = 35;
const END_CR: u8 = 36;
const STATE_COUNT: usize = 37;
// Action pseudo-states
const ERR: u8 = STATE_COUNT as u8;
const A_METHOD: u8 = ERR + 1; // method complete
const A_URI: u8 = ERR + 2; // uri complete
const A_VERSION: u8 = ERR + 3; // response version complete
const A_STATUS: u8 = ERR + 4; // status code complete
const A_TEXT: u8 = ERR + 5; // reason text complete
const A_PAIR: u8 = ERR + 6; // header pair complete, new key begins
const A_KEY: u8 = ERR + 7; // header key complete
const A_FOLD: u8 = ERR + 8; // folded value continues
const A_DONE: u8 = ERR + 9; // final CRLF seen

#[rustfmt::skip]
const STATE_TABLE: [[u8; CLASS_COUNT]; STATE_COUNT] = [
    /*          ctl       \n        \r        lws       tsp       /         :         .         num       H         T         P         etc     */
    /*R_GO  */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_METHOD, R_METHOD, R_METHOD, R_METHOD, R_METHOD, R_METHOD],
    /*R_MTD */ [ERR,      ERR,      ERR,      A_METHOD, ERR,      ERR,      ERR,      R_METHOD, R_METHOD, R_METHOD, R_METHOD, R_METHOD, R_METHOD],
    /*R_MSP */ [ERR,      ERR,      ERR,      R_MSP,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI    ],
    /*R_URI */ [ERR,      ERR,      ERR,      A_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI,    R_URI    ],
    /*R_USP */ [ERR,      ERR,      ERR,      R_USP,    ERR,      ERR,      ERR,      ERR,      ERR,      R_H,      ERR,      ERR,      ERR      ],
    /*R_H   */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_HT,     ERR,      ERR      ],
    /*R_HT  */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_HTT,    ERR,      ERR      ],
    /*R_HTT */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_HTTP,   ERR      ],
    /*R_HTTP*/ [ERR,      ERR,      ERR,      R_HTTP,   ERR,      R_SLASH,  ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
    /*R_SLH */ [ERR,      ERR,      ERR,      R_SLASH,  ERR,      ERR,      ERR,      ERR,      R_MAJOR,  ERR,      ERR,      ERR,      ERR      ],
    /*R_MAJ */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_DOT,    R_MAJOR,  ERR,      ERR,      ERR,      ERR      ],
    /*R_DOT */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      R_MINOR,  ERR,      ERR,      ERR,      ERR      ],
    /*R_MIN */ [ERR,      ERR,      EOL_CR,   ERR,      ERR,      ERR,      ERR,      ERR,      R_MINOR,  ERR,      ERR,      ERR,      ERR      ],
    /*S_GO  */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_H,      ERR,      ERR,      ERR      ],
    /*S_H   */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_HT,     ERR,      ERR      ],
    /*S_HT  */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_HTT,    ERR,      ERR      ],
    /*S_HTT */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_HTTP,   ERR      ],
    /*S_HTTP*/ [ERR,      ERR,      ERR,      S_HTTP,   ERR,      S_SLASH,  ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
    /*S_SLH */ [ERR,      ERR,      ERR,      S_SLASH,  ERR,      ERR,      ERR,      ERR,      S_MAJOR,  ERR,      ERR,      ERR,      ERR      ],
    /*S_MAJ */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_DOT,    S_MAJOR,  ERR,      ERR,      ERR,      ERR      ],
    /*S_DOT */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      S_MINOR,  ERR,      ERR,      ERR,      ERR      ],
    /*S_MIN */ [ERR,      ERR,      ERR,      A_VERSION,ERR,      ERR,      ERR,      ERR,      S_MINOR,  ERR,      ERR,      ERR,      ERR      ],
    /*S_SSP */ [ERR,      ERR,      ERR,      S_SSP,    ERR,      ERR,      ERR,      ERR,      S_STATUS, ERR,      ERR,      ERR,      ERR      ],
    /*S_STA */ [ERR,      ERR,      ERR,      A_STATUS, ERR,      ERR,      ERR,      ERR,      S_STATUS, ERR,      ERR,      ERR,      ERR      ],
    /*S_TSP */ [ERR,      ERR,      ERR,      S_TSP,    S_TEXT,   ERR,      ERR,      ERR,      S_TEXT,   S_TEXT,   S_TEXT,   S_TEXT,   S_TEXT   ],
    /*S_TXT */ [ERR,      ERR,      A_TEXT,   S_TEXT,   S_TEXT,   ERR,      ERR,      ERR,      S_TEXT,   S_TEXT,   S_TEXT,   S_TEXT,   S_TEXT   ],
    /*EOL_CR*/ [ERR,      EOL_LF,   ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
    /*EOL_LF*/ [ERR,      ERR,      END_CR,   ERR,      ERR,      ERR,      ERR,      H_KEY,    H_KEY,    H_KEY,    H_KEY,    H_KEY,    H_KEY    ],
    /*H_KEY */ [ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      A_KEY,    H_KEY,    H_KEY,    H_KEY,    H_KEY,    H_KEY,    H_KEY    ],
    /*H_COL */ [ERR,      ERR,      H_ECR,    H_COLON,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE  ],
    /*H_VAL */ [ERR,      ERR,      V_CR,     H_LWS,    H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE,  H_VALUE  ],
    /*H_LWS */ [ERR,      ERR,      V_CR,     H_LWS,    A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD,   A_FOLD   ],
    /*H_ECR */ [ERR,      H_ECRLF,  ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
    /*H_ECRL*/ [ERR,      ERR,      END_CR,   H_COLON,  ERR,      ERR,      ERR,      A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR   ],
    /*V_CR  */ [ERR,      V_CRLF,   ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
    /*V_CRLF*/ [ERR,      ERR,      END_CR,   H_LWS,    ERR,      ERR,      ERR,      A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR,   A_PAIR   ],
    /*END_CR*/ [ERR,      A_DONE,   ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR,      ERR      ],
];

/// Which kind of message this parser decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

/// Incremental HTTP request or response head parser.
///
/// Produces one `Value::Map` per decode:
/// - requests: `method`, `uri`, `version`, `headers`
/// - responses: `version`, `status`, `text`, `headers`
///
/// Message bodies are not consumed; after a decode completes the buffer
/// cursors delimit exactly the unread remainder.
pub struct HttpParser {
    kind: Kind,
    state: u8,
    /// Write cursor for in-place token compaction; always trails the read
    /// cursor so buffered bytes are never clobbered before being read.
    w: usize,
    method: String,
    uri: String,
    version: String,
    status: i64,
    text: String,
    key: Option<String>,
    headers: BTreeMap<String, Value>,
}

const _: () = assert!(core::mem::size_of::<HttpParser>() <= STATE_SIZE_MAX);

// `Parser` requires `Send` (parsers are carried inside `Send` worker-pool jobs
// between file reads). `HttpParser` holds a `BTreeMap<String, Value>`, and
// `Value` is non-`Send` only through its `Opaque(Rc<dyn Any>)` variant — which
// this parser never constructs: it stores only `Value::Str`/`Value::Int`. The
// contained state is therefore genuinely safe to move across threads.
unsafe impl Send for HttpParser {}

impl HttpParser {
    /// Parser for a request line plus headers.
    pub fn request() -> Self {
        HttpParser::new(Kind::Request)
    }

    /// Parser for a status line plus headers.
    pub fn response() -> Self {
        HttpParser::new(Kind::Response)
    }

    fn new(kind: Kind) -> Self {
        HttpParser {
            kind,
            state: match kind {
                Kind::Request => R_GO,
                Kind::Response => S_GO,
            },
            w: 0,
            method: String::new(),
            uri: String::new(),
            version: String::new(),
            status: 0,
            text: String::new(),
            key: None,
            headers: BTreeMap::new(),
        }
    }

    fn take_token(buf: &InputBuf, w: usize) -> String {
        // The FSM only routes ASCII into tokens
        String::from_utf8_lossy(&buf.buf[..w]).into_owned()
    }

    fn take_message(&mut self) -> Vec<Value> {
        let mut msg = BTreeMap::new();
        match self.kind {
            Kind::Request => {
                msg.insert("method".into(), Value::Str(core::mem::take(&mut self.method)));
                msg.insert("uri".into(), Value::Str(core::mem::take(&mut self.uri)));
                msg.insert("version".into(), Value::Str(core::mem::take(&mut self.version)));
            }
            Kind::Response => {
                msg.insert("version".into(), Value::Str(core::mem::take(&mut self.version)));
                msg.insert("status".into(), Value::Int(self.status));
                msg.insert("text".into(), Value::Str(core::mem::take(&mut self.text)));
            }
        }
        msg.insert(
            "headers".into(),
            Value::Map(core::mem::take(&mut self.headers)),
        );
        vec![Value::Map(msg)]
    }
}

impl Parser for HttpParser {
    fn process(&mut self, buf: &mut InputBuf) -> ParseResult {
        let mut state = self.state;
        let mut w = self.w;
        let mut r = buf.start;
        let end = buf.end;

        while r < end {
            let ch = buf.buf[r];
            r += 1;

            let class = if ch > 127 { ETC } else { ASCII_CLASS[ch as usize] };
            state = STATE_TABLE[state as usize][class as usize];

            match state {
                R_METHOD | R_URI | R_MAJOR | R_DOT | R_MINOR | S_MAJOR | S_DOT | S_MINOR
                | S_STATUS | S_TEXT | H_VALUE => {
                    buf.buf[w] = ch;
                    w += 1;
                }

                A_PAIR => {
                    state = H_KEY;
                    let value = Self::take_token(buf, w);
                    if let Some(key) = self.key.take() {
                        self.headers.insert(key, Value::Str(value));
                    }
                    w = 0;
                    // the triggering character starts the next key
                    buf.buf[w] = ch.to_ascii_lowercase();
                    w += 1;
                }

                H_KEY => {
                    buf.buf[w] = ch.to_ascii_lowercase();
                    w += 1;
                }

                EOL_CR => {
                    // Request line complete: the accumulated digits are the
                    // version (responses route through A_VERSION instead)
                    self.version = Self::take_token(buf, w);
                    w = 0;
                }

                ERR => {
                    self.state = ERR;
                    return Err(ParseError::Syntax("invalid state/class combination"));
                }

                A_METHOD => {
                    state = R_MSP;
                    self.method = Self::take_token(buf, w);
                    w = 0;
                }

                A_URI => {
                    state = R_USP;
                    self.uri = Self::take_token(buf, w);
                    w = 0;
                }

                A_VERSION => {
                    state = S_SSP;
                    self.version = Self::take_token(buf, w);
                    w = 0;
                }

                A_STATUS => {
                    state = S_TSP;
                    let mut n: i64 = 0;
                    for &d in &buf.buf[..w] {
                        n = n * 10 + i64::from(d - b'0');
                    }
                    self.status = n;
                    w = 0;
                }

                A_TEXT => {
                    state = EOL_CR;
                    self.text = Self::take_token(buf, w);
                    w = 0;
                }

                A_KEY => {
                    state = H_COLON;
                    self.key = Some(Self::take_token(buf, w));
                    w = 0;
                }

                A_FOLD => {
                    // folded or space-separated continuation: rejoin with
                    // exactly one space
                    state = H_VALUE;
                    buf.buf[w] = b' ';
                    buf.buf[w + 1] = ch;
                    w += 2;
                }

                A_DONE => {
                    if let Some(key) = self.key.take() {
                        let value = Self::take_token(buf, w);
                        self.headers.insert(key, Value::Str(value));
                    }
                    if r == end {
                        buf.clear();
                    } else {
                        buf.start = r;
                    }
                    return Ok(ParseStatus::Done(self.take_message()));
                }

                _ => {}
            }
        }

        if w >= INPUTBUF_SIZE - 1 {
            buf.clear();
            return Err(ParseError::OutOfSpace);
        }

        // Compacted token occupies [0, w); leave one byte of headroom so the
        // write cursor keeps trailing the read cursor after the next fill.
        buf.start = w + 1;
        buf.end = w + 1;
        self.state = state;
        self.w = w;
        Ok(ParseStatus::More)
    }
}
