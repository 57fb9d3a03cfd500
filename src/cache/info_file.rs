//! Line-oriented info file holding the scan records for one module.
//!
//! ```text
//! fxbridge-vst-info 1
//! <plugin path>
//! <record count>
//! <record>...
//! ```
//!
//! A record is one value per line: name, vendor, unique id, category tag,
//! inputs, outputs, program count, parameter count P, MIDI inputs, MIDI
//! outputs, has-editor, can-replace, is-instrument, P parameter names, P
//! parameter labels, sub-plugin count S and S lines of `<id> <name>`.

use std::path::Path;
use std::str::Lines;

use crate::scan::{PluginCategory, ScanRecord};

pub const MAGIC: &str = "fxbridge-vst-info";
pub const VERSION: u32 = 1;

/// Keep a value on one line.
fn clean(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub fn render(plugin: &Path, records: &[ScanRecord]) -> String {
    let mut out = String::new();
    let mut line = |s: &str| {
        out.push_str(s);
        out.push('\n');
    };

    line(&format!("{} {}", MAGIC, VERSION));
    line(&clean(&plugin.to_string_lossy()));
    line(&records.len().to_string());

    for r in records {
        line(&clean(&r.name));
        line(&clean(&r.vendor));
        line(&r.unique_id.to_string());
        line(r.category.as_str());
        line(&r.inputs.to_string());
        line(&r.outputs.to_string());
        line(&r.num_programs.to_string());
        line(&r.num_params.to_string());
        line(&r.midi_inputs.to_string());
        line(&r.midi_outputs.to_string());
        line(flag(r.has_editor));
        line(flag(r.can_replace));
        line(flag(r.is_instrument));
        for i in 0..r.num_params.max(0) as usize {
            line(&clean(r.param_names.get(i).map(String::as_str).unwrap_or("No Name")));
        }
        for i in 0..r.num_params.max(0) as usize {
            line(&clean(r.param_labels.get(i).map(String::as_str).unwrap_or("No Label")));
        }
        line(&r.sub_ids.len().to_string());
        for (i, id) in r.sub_ids.iter().enumerate() {
            let name = r.sub_names.get(i).map(String::as_str).unwrap_or("Unknown");
            line(&format!("{} {}", id, clean(name)));
        }
    }
    out
}

struct Reader<'a> {
    lines: Lines<'a>,
    line_no: usize,
}

impl<'a> Reader<'a> {
    fn next(&mut self) -> Result<&'a str, String> {
        self.line_no += 1;
        self.lines
            .next()
            .ok_or_else(|| format!("unexpected end of file at line {}", self.line_no))
    }

    fn number<T: std::str::FromStr>(&mut self) -> Result<T, String> {
        let line = self.next()?;
        line.trim()
            .parse()
            .map_err(|_| format!("line {}: expected a number, got {:?}", self.line_no, line))
    }

    fn flag(&mut self) -> Result<bool, String> {
        match self.next()? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(format!("line {}: expected 0 or 1, got {:?}", self.line_no, other)),
        }
    }
}

/// Parse an info file, checking it belongs to `plugin`.
pub fn parse(text: &str, plugin: &Path) -> Result<Vec<ScanRecord>, String> {
    let mut reader = Reader {
        lines: text.lines(),
        line_no: 0,
    };

    let header = reader.next()?;
    let version = header
        .strip_prefix(MAGIC)
        .map(str::trim)
        .ok_or_else(|| format!("bad header {:?}", header))?;
    if version != VERSION.to_string() {
        return Err(format!("unsupported version {:?}", version));
    }

    let stored_path = reader.next()?;
    if stored_path != clean(&plugin.to_string_lossy()) {
        return Err(format!("path mismatch: {}", stored_path));
    }

    let count: usize = reader.number()?;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let mut r = ScanRecord {
            name: reader.next()?.to_string(),
            vendor: reader.next()?.to_string(),
            unique_id: reader.number()?,
            ..ScanRecord::default()
        };
        let tag = reader.next()?;
        r.category = PluginCategory::parse(tag).ok_or_else(|| format!("unknown category {:?}", tag))?;
        r.inputs = reader.number()?;
        r.outputs = reader.number()?;
        r.num_programs = reader.number()?;
        r.num_params = reader.number()?;
        if r.num_params < 0 {
            return Err(format!("negative parameter count {}", r.num_params));
        }
        r.midi_inputs = reader.number()?;
        r.midi_outputs = reader.number()?;
        r.has_editor = reader.flag()?;
        r.can_replace = reader.flag()?;
        r.is_instrument = reader.flag()?;
        for _ in 0..r.num_params {
            r.param_names.push(reader.next()?.to_string());
        }
        for _ in 0..r.num_params {
            r.param_labels.push(reader.next()?.to_string());
        }
        let subs: usize = reader.number()?;
        for _ in 0..subs {
            let line = reader.next()?;
            let (id, name) = line.split_once(' ').unwrap_or((line, ""));
            let id = id
                .parse()
                .map_err(|_| format!("line {}: bad sub-plugin id {:?}", reader.line_no, id))?;
            r.sub_ids.push(id);
            r.sub_names.push(name.to_string());
        }
        records.push(r);
    }
    Ok(records)
}
