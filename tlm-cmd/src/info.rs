use std::collections::HashMap;
use std::io::{stdout, Write};
use std::path::Path;

use anyhow::{Context, Result};
use handlebars::handlebars_helper;
use hifitime::Epoch;
use serde::Serialize;
use tracing::debug;

use tlm::spacepacket::{decode_packets, missing_packets, Apid, Packet};
use tlm::timecode;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TCFormat {
    Cds,
    None,
}

impl clap::ValueEnum for TCFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Cds, Self::None]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Cds => Some(clap::builder::PossibleValue::new("cds")),
            Self::None => Some(clap::builder::PossibleValue::new("none")),
        }
    }
}

/// Running per-APID or overall totals.
#[derive(Default, Debug, Clone)]
struct Acc {
    count: usize,
    bytes: usize,
    missing: usize,
    first: Option<Epoch>,
    last: Option<Epoch>,
}

impl Acc {
    fn update(&mut self, packet: &Packet, missing: usize, epoch: Option<Epoch>) {
        self.count += 1;
        self.bytes += packet.header.total_length();
        self.missing += missing;
        if let Some(epoch) = epoch {
            self.first = Some(self.first.map_or(epoch, |cur| cur.min(epoch)));
            self.last = Some(self.last.map_or(epoch, |cur| cur.max(epoch)));
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    total_packets: usize,
    total_bytes: usize,
    missing_packets: usize,
    first_packet_time: Option<String>,
    last_packet_time: Option<String>,
    duration_s: f64,
}

impl From<&Acc> for Summary {
    fn from(acc: &Acc) -> Self {
        let duration_s = match (acc.first, acc.last) {
            (Some(first), Some(last)) => (last - first).to_seconds(),
            _ => 0.0,
        };
        Summary {
            total_packets: acc.count,
            total_bytes: acc.bytes,
            missing_packets: acc.missing,
            first_packet_time: acc.first.map(|e| e.to_string()),
            last_packet_time: acc.last.map(|e| e.to_string()),
            duration_s,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApidInfo {
    apid: Apid,
    #[serde(flatten)]
    summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
struct Info {
    filename: String,
    summary: Summary,
    apids: Vec<ApidInfo>,
}

fn summarize(fpath: &Path, tc_format: &TCFormat) -> Result<Info> {
    let reader = std::fs::File::open(fpath).context("opening input")?;
    let time_format = match tc_format {
        TCFormat::Cds => Some(timecode::Format::Cds {
            num_day: 2,
            num_submillis: 2,
        }),
        TCFormat::None => None,
    };

    let mut last_seqid: HashMap<Apid, u16> = HashMap::default();
    let mut apids: HashMap<Apid, Acc> = HashMap::default();
    let mut total = Acc::default();

    for packet in decode_packets(reader).filter_map(Result::ok) {
        let apid = packet.header.apid;
        let missing = match last_seqid.get(&apid) {
            Some(last) => missing_packets(packet.header.sequence_id, *last) as usize,
            None => 0,
        };
        last_seqid.insert(apid, packet.header.sequence_id);

        // packets read here carry the whole data field as user data
        let epoch = match &time_format {
            Some(format) if packet.header.has_secondary_header => {
                match timecode::decode(format, &packet.user_data) {
                    Ok(epoch) => Some(epoch),
                    Err(err) => {
                        debug!(apid, %err, "failed to decode time");
                        None
                    }
                }
            }
            _ => None,
        };

        total.update(&packet, missing, epoch);
        apids.entry(apid).or_default().update(&packet, missing, epoch);
    }

    let mut apids: Vec<ApidInfo> = apids
        .iter()
        .map(|(apid, acc)| ApidInfo {
            apid: *apid,
            summary: Summary::from(acc),
        })
        .collect();
    apids.sort_by_key(|a| a.apid);

    Ok(Info {
        filename: fpath.to_string_lossy().to_string(),
        summary: Summary::from(&total),
        apids,
    })
}

pub fn info(fpath: &Path, format: &Format, tc_format: &TCFormat) -> Result<()> {
    let info = summarize(fpath, tc_format)?;

    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), &info).context("serializing to json")
        }
        Format::Text => {
            let data = render_text(&info).context("serializing info")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")
        }
    }
}

fn render_text(info: &Info) -> Result<String> {
    handlebars_helper!(lpad: |num: u64, v: Json| {
        let v = match v {
            serde_json::Value::String(s) => s.to_owned(),
            serde_json::Value::Null => String::new(),
            _ => v.to_string(),
        };
        format!("{v:>width$}", width = num as usize)
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_helper("lpad", Box::new(lpad));
    hb.register_template_string("info", TEXT_TEMPLATE)
        .context("registering template")?;

    hb.render("info", &info).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"{{ filename }}
===============================================================================================
First:    {{ summary.first_packet_time }}
Last:     {{ summary.last_packet_time }}
Duration: {{ summary.duration_s }}s
Count:    {{ summary.total_packets }}
Bytes:    {{ summary.total_bytes }}
Missing:  {{ summary.missing_packets }}
-----------------------------------------------------------------------------------------------
APID    First                              Last                                 Count   Missing
-----------------------------------------------------------------------------------------------
{{ #each apids }}{{ lpad 6 apid }}  {{ lpad 33 first_packet_time }}  {{ lpad 33 last_packet_time }}   {{ lpad 6 total_packets }}   {{ lpad 7 missing_packets }}
{{/each }}
";
