use crate::prelude::*;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit0, digit1, space1},
    combinator::{eof, map, map_res, opt, peek, recognize},
    sequence::{pair, tuple},
    IResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParcelKind {
    State,
    AnalogSample,
    LoadSample,
    Temperature,
    VoltageSample,
    CurrentSample,
    InsulationReply,
    GenericReply,
}

impl ParcelKind {
    /// Counted kinds a power unit sends.
    pub const POWER: [ParcelKind; 4] = [
        ParcelKind::State,
        ParcelKind::AnalogSample,
        ParcelKind::LoadSample,
        ParcelKind::Temperature,
    ];

    /// Counted kinds an input unit sends.
    pub const INPUT: [ParcelKind; 3] = [
        ParcelKind::State,
        ParcelKind::VoltageSample,
        ParcelKind::CurrentSample,
    ];

    pub fn is_counted(self) -> bool {
        !matches!(self, ParcelKind::InsulationReply | ParcelKind::GenericReply)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParcelBody {
    PowerState {
        states: [ChannelState; 2],
        signals: [u16; 2],
    },
    Current {
        current: [f64; 2],
    },
    Load {
        load: [u16; 2],
        angle: [u16; 2],
    },
    Temperature {
        temperature: [u16; 2],
    },
    InputState {
        state: u16,
        signal: u16,
    },
    Voltage {
        vin: f64,
        frequency: f64,
    },
    InputCurrent {
        iin: f64,
        iout: f64,
        iypr: f64,
    },
    Insulation {
        position: ChannelPosition,
        value: String,
    },
    Reply {
        text: String,
    },
}

/// One decoded line from a unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Parcel {
    pub unit: UnitAddress,
    pub counter: Option<u32>,
    pub body: ParcelBody,
}

impl Parcel {
    pub fn kind(&self) -> ParcelKind {
        match self.body {
            ParcelBody::PowerState { .. } | ParcelBody::InputState { .. } => ParcelKind::State,
            ParcelBody::Current { .. } => ParcelKind::AnalogSample,
            ParcelBody::Load { .. } => ParcelKind::LoadSample,
            ParcelBody::Temperature { .. } => ParcelKind::Temperature,
            ParcelBody::Voltage { .. } => ParcelKind::VoltageSample,
            ParcelBody::InputCurrent { .. } => ParcelKind::CurrentSample,
            ParcelBody::Insulation { .. } => ParcelKind::InsulationReply,
            ParcelBody::Reply { .. } => ParcelKind::GenericReply,
        }
    }
}

// Grammar {{{
fn number<T: FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, |s: &str| s.parse::<T>())(input)
}

fn decimal(input: &str) -> IResult<&str, f64> {
    map_res(recognize(pair(digit1, opt(pair(char('.'), digit0)))), |s: &str| {
        s.parse::<f64>()
    })(input)
}

fn channel_state(input: &str) -> IResult<&str, ChannelState> {
    map(number::<u8>, ChannelState::from)(input)
}

fn arg<'a, O, F>(mut parser: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    move |input| {
        let (input, _) = space1(input)?;
        parser(input)
    }
}

// `<counter><unit>` closing every counted parcel, e.g. ` 1234m1`.
fn trailer<'a>(unit: &'a str) -> impl FnMut(&'a str) -> IResult<&'a str, u32> {
    move |input| {
        let (input, _) = space1(input)?;
        let (input, counter) = number::<u32>(input)?;
        let (input, _) = tag(unit)(input)?;
        let (input, _) = peek(alt((eof, space1)))(input)?;
        Ok((input, counter))
    }
}

fn power_state(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, s1, s2, g1, g2)) = tuple((
        tag("st"),
        arg(channel_state),
        arg(channel_state),
        arg(number::<u16>),
        arg(number::<u16>),
    ))(input)?;

    Ok((
        input,
        ParcelBody::PowerState {
            states: [s1, s2],
            signals: [g1, g2],
        },
    ))
}

fn current(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, i1, i2)) = tuple((tag("adc"), arg(decimal), arg(decimal)))(input)?;

    Ok((input, ParcelBody::Current { current: [i1, i2] }))
}

fn load(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, l1, l2, a1, a2)) = tuple((
        tag("ld"),
        arg(number::<u16>),
        arg(number::<u16>),
        arg(number::<u16>),
        arg(number::<u16>),
    ))(input)?;

    Ok((
        input,
        ParcelBody::Load {
            load: [l1, l2],
            angle: [a1, a2],
        },
    ))
}

fn temperature(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, t1, t2)) =
        tuple((tag("tmpr"), arg(number::<u16>), arg(number::<u16>)))(input)?;

    Ok((
        input,
        ParcelBody::Temperature {
            temperature: [t1, t2],
        },
    ))
}

fn input_state(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, state, signal)) =
        tuple((tag("st"), arg(number::<u16>), arg(number::<u16>)))(input)?;

    Ok((input, ParcelBody::InputState { state, signal }))
}

fn voltage(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, vin, frequency)) =
        tuple((tag("volt"), arg(decimal), arg(number::<u16>)))(input)?;

    Ok((
        input,
        ParcelBody::Voltage {
            vin,
            frequency: frequency as f64,
        },
    ))
}

fn input_current(input: &str) -> IResult<&str, ParcelBody> {
    let (input, (_, iin, iout, iypr)) =
        tuple((tag("cur"), arg(decimal), arg(decimal), arg(decimal)))(input)?;

    Ok((input, ParcelBody::InputCurrent { iin, iout, iypr }))
} // }}}

/// Parser bound to one unit: counted parcels only match when they end in
/// this unit's address.
#[derive(Clone, Debug)]
pub struct ParcelParser {
    unit: UnitAddress,
    kind: UnitKind,
}

impl ParcelParser {
    pub fn new(unit: UnitAddress, kind: UnitKind) -> Self {
        Self { unit, kind }
    }

    pub fn parse(&self, frame: &[u8]) -> Option<Parcel> {
        let line = std::str::from_utf8(frame).ok()?.trim();

        // the line may start with noise; try each word in turn
        std::iter::once(0)
            .chain(line.match_indices(' ').map(|(i, _)| i + 1))
            .find_map(|start| self.parse_from(&line[start..]))
    }

    fn parse_from(&self, line: &str) -> Option<Parcel> {
        if let Some(text) = line.strip_prefix("rply ") {
            return Some(self.reply(text.trim()));
        }

        let unit = self.unit.as_str();
        let result = match self.kind {
            UnitKind::Power => pair(alt((power_state, current, load, temperature)), trailer(unit))(line),
            UnitKind::Input => pair(alt((input_state, voltage, input_current)), trailer(unit))(line),
        };

        let (_, (body, counter)) = result.ok()?;

        Some(Parcel {
            unit: self.unit.clone(),
            counter: Some(counter),
            body,
        })
    }

    // `isol ch<N> <value> <counter><unit>` is the answer to `resist start`;
    // anything else is passed through as text.
    fn reply(&self, text: &str) -> Parcel {
        if let Some((position, value, counter)) = self.insulation(text) {
            return Parcel {
                unit: self.unit.clone(),
                counter: Some(counter),
                body: ParcelBody::Insulation { position, value },
            };
        }

        Parcel {
            unit: self.unit.clone(),
            counter: None,
            body: ParcelBody::Reply {
                text: text.to_owned(),
            },
        }
    }

    fn insulation(&self, text: &str) -> Option<(ChannelPosition, String, u32)> {
        let parts: Vec<&str> = text.split_whitespace().collect();

        match parts[..] {
            ["isol", channel, value, trailer] => {
                let position = ChannelPosition::from_str(channel.strip_prefix("ch")?).ok()?;
                let counter = trailer.strip_suffix(self.unit.as_str())?;
                if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }

                Some((position, value.to_owned(), counter.parse().ok()?))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power(unit: &str) -> ParcelParser {
        ParcelParser::new(UnitAddress::from_str(unit).unwrap(), UnitKind::Power)
    }

    fn input(unit: &str) -> ParcelParser {
        ParcelParser::new(UnitAddress::from_str(unit).unwrap(), UnitKind::Input)
    }

    #[test]
    fn power_state() {
        let parcel = power("m1").parse(b"st 4 5 12 0 1234m1").unwrap();

        assert_eq!(parcel.kind(), ParcelKind::State);
        assert_eq!(parcel.counter, Some(1234));
        assert_eq!(
            parcel.body,
            ParcelBody::PowerState {
                states: [ChannelState::Off, ChannelState::On],
                signals: [12, 0],
            }
        );
    }

    #[test]
    fn power_samples() {
        let p = power("m2");

        assert_eq!(
            p.parse(b"adc 1.25 0.5 7m2").unwrap().body,
            ParcelBody::Current { current: [1.25, 0.5] }
        );
        assert_eq!(
            p.parse(b"ld 100 200 40 0 8m2").unwrap().body,
            ParcelBody::Load {
                load: [100, 200],
                angle: [40, 0],
            }
        );
        assert_eq!(
            p.parse(b"tmpr 31 29 9m2").unwrap().body,
            ParcelBody::Temperature { temperature: [31, 29] }
        );
    }

    #[test]
    fn input_parcels() {
        let p = input("m9");

        assert_eq!(
            p.parse(b"st 3 1 1m9").unwrap().body,
            ParcelBody::InputState { state: 3, signal: 1 }
        );
        assert_eq!(
            p.parse(b"volt 221.5 50 2m9").unwrap().body,
            ParcelBody::Voltage {
                vin: 221.5,
                frequency: 50.0,
            }
        );
        assert_eq!(
            p.parse(b"cur 1.0 2.5 0.25 3m9").unwrap().body,
            ParcelBody::InputCurrent {
                iin: 1.0,
                iout: 2.5,
                iypr: 0.25,
            }
        );

        // power-unit grammar is not accepted from an input unit
        assert!(p.parse(b"st 4 4 0 0 4m9").is_none());
    }

    #[test]
    fn other_units_are_ignored() {
        let p = power("m1");

        assert!(p.parse(b"st 4 4 0 0 12m2").is_none());
        assert!(p.parse(b"st 4 4 0 0 12m12").is_none());
        assert!(p.parse(b"st 4 4 0 0 m1").is_none());
    }

    #[test]
    fn leading_noise() {
        let parcel = power("m1").parse(b"\x00garbage st 4 4 0 0 5m1\r").unwrap();

        assert_eq!(parcel.counter, Some(5));
    }

    #[test]
    fn unknown_state_code() {
        let parcel = power("m1").parse(b"st 9 4 0 0 1m1").unwrap();

        assert_eq!(
            parcel.body,
            ParcelBody::PowerState {
                states: [ChannelState::Unknown(9), ChannelState::Off],
                signals: [0, 0],
            }
        );
    }

    #[test]
    fn malformed() {
        let p = power("m1");

        assert!(p.parse(b"").is_none());
        assert!(p.parse(b"st 4 4 0 1m1").is_none());
        assert!(p.parse(b"st x 4 0 0 1m1").is_none());
        assert!(p.parse(b"st 4 4 0 0 99999999999m1").is_none());
        assert!(p.parse(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn insulation_reply() {
        let parcel = power("m2").parse(b"rply isol ch2 1500 77m2").unwrap();

        assert_eq!(parcel.kind(), ParcelKind::InsulationReply);
        assert_eq!(parcel.counter, Some(77));
        assert_eq!(
            parcel.body,
            ParcelBody::Insulation {
                position: ChannelPosition::Two,
                value: "1500".to_owned(),
            }
        );
        assert!(!parcel.kind().is_counted());
    }

    #[test]
    fn generic_reply() {
        let parcel = power("m2").parse(b"rply isol ch2 1500 77m3").unwrap();

        assert_eq!(parcel.kind(), ParcelKind::GenericReply);
        assert_eq!(
            parcel.body,
            ParcelBody::Reply {
                text: "isol ch2 1500 77m3".to_owned(),
            }
        );
    }
}
