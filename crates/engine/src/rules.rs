//! Filter-rule exchange.
//!
//! The receiving side owns the include/exclude rules but the sender applies
//! them during its tree walk, so the rules cross the wire right after the
//! handshake: one length-prefixed `+`/`-` line per rule, ended by a zero
//! length.

use std::io::{Read, Write};

use filters::{FilterSet, Rule, RuleKind};
use protocol::varint::{read_var_int, write_var_int};

use crate::error::EngineError;

/// Sanity bound on one rule line.
const MAX_RULE_LEN: usize = 1024;

/// Writes the rule list, terminator included.
pub fn write_filter_rules<W: Write>(writer: &mut W, filters: &FilterSet) -> Result<(), EngineError> {
    for rule in filters.rules() {
        let prefix = match rule.kind() {
            RuleKind::Include => "+ ",
            RuleKind::Exclude => "- ",
        };
        let line = format!("{prefix}{}", rule.pattern());
        write_var_int(writer, line.len() as i32).map_err(protocol::ProtocolError::from)?;
        writer
            .write_all(line.as_bytes())
            .map_err(protocol::ProtocolError::from)?;
    }
    write_var_int(writer, 0).map_err(protocol::ProtocolError::from)?;
    Ok(())
}

/// Reads a rule list written by [`write_filter_rules`].
pub fn read_filter_rules<R: Read>(reader: &mut R) -> Result<FilterSet, EngineError> {
    let mut filters = FilterSet::new();
    loop {
        let len = read_var_int(reader)?;
        if len == 0 {
            return Ok(filters);
        }
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_RULE_LEN)
            .ok_or(EngineError::Sequence("filter rule length out of range"))?;

        let mut line = vec![0u8; len];
        reader
            .read_exact(&mut line)
            .map_err(protocol::ProtocolError::from)?;
        let line = String::from_utf8(line)
            .map_err(|_| EngineError::Sequence("filter rule is not UTF-8"))?;

        let rule =
            Rule::parse(&line).map_err(|_| EngineError::Sequence("unparsable filter rule"))?;
        match rule.kind() {
            RuleKind::Include => filters.include(rule.pattern()),
            RuleKind::Exclude => filters.exclude(rule.pattern()),
        }
        .map_err(|_| EngineError::Sequence("unparsable filter rule"))?;
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn rules_survive_the_wire() {
        let mut filters = FilterSet::new();
        filters.include("important.log").expect("valid pattern");
        filters.exclude("*.log").expect("valid pattern");

        let mut wire = Vec::new();
        write_filter_rules(&mut wire, &filters).expect("vec write");
        let decoded = read_filter_rules(&mut wire.as_slice()).expect("decode");

        assert!(decoded.keeps(Path::new("important.log"), false));
        assert!(!decoded.keeps(Path::new("noise.log"), false));
    }

    #[test]
    fn empty_set_is_one_terminator() {
        let mut wire = Vec::new();
        write_filter_rules(&mut wire, &FilterSet::new()).expect("vec write");
        assert_eq!(wire, [0]);
        assert!(
            read_filter_rules(&mut wire.as_slice())
                .expect("decode")
                .is_empty()
        );
    }

    #[test]
    fn oversized_rules_are_rejected() {
        let mut wire = Vec::new();
        write_var_int(&mut wire, (MAX_RULE_LEN + 1) as i32).expect("vec write");
        assert!(read_filter_rules(&mut wire.as_slice()).is_err());
    }
}
