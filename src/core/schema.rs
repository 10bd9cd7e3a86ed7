//! Attribute-to-flag schema for `iptables` rules
//!
//! Every rule attribute maps to one or more command-line flag spellings. The
//! first spelling is the one written by the serializer; every spelling is
//! recognised by the parser.
//!
//! # Emission Order
//!
//! [`Attribute`] variants are declared in the order `iptables-save` prints
//! them. Both the parser and the serializer walk that order, so it must never
//! be reshuffled: a rule whose flags come back in a different order will look
//! changed on every run and be re-applied forever.
//!
//! # Match Modules
//!
//! Some attributes share a single `-m <module>` announcement (for example
//! `uid` and `gid` both live under `-m owner`). [`FlagMap::expand_for_line`]
//! and [`FlagMap::expand_for_values`] prefix the module onto the first
//! present member of each group, mirroring the tool's rule that a module is
//! announced once and followed by its option flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rule attribute known to the schema.
///
/// Declaration order is the canonical emission order (see module docs), and
/// the derived `Ord` follows it, so a `BTreeMap<Attribute, _>` iterates in
/// emission order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Attribute {
    Table,
    Source,
    Destination,
    Iniface,
    Outiface,
    PhysdevIn,
    PhysdevOut,
    PhysdevIsBridged,
    Proto,
    Isfragment,
    StatMode,
    StatEvery,
    StatPacket,
    StatProbability,
    SrcRange,
    DstRange,
    TcpFlags,
    Uid,
    Gid,
    MacSource,
    Sport,
    Dport,
    Port,
    SrcType,
    DstType,
    Socket,
    Pkttype,
    Name,
    IpsecDir,
    IpsecPolicy,
    State,
    Ctstate,
    Icmp,
    Limit,
    Burst,
    Length,
    Recent,
    Rseconds,
    Reap,
    Rhitcount,
    Rttl,
    Rname,
    Mask,
    Rsource,
    Rdest,
    Ipset,
    #[serde(rename = "string")]
    #[strum(serialize = "string")]
    StringMatch,
    StringAlgo,
    StringFrom,
    StringTo,
    Jump,
    Goto,
    ClusteripNew,
    ClusteripHashmode,
    ClusteripClustermac,
    ClusteripTotalNodes,
    ClusteripLocalNode,
    ClusteripHashInit,
    ClampMssToPmtu,
    Gateway,
    SetMss,
    SetDscp,
    SetDscpClass,
    Todest,
    Tosource,
    Toports,
    To,
    ChecksumFill,
    Random,
    LogPrefix,
    LogLevel,
    LogUid,
    Reject,
    SetMark,
    MatchMark,
    Mss,
    ConnlimitAbove,
    ConnlimitMask,
    Connmark,
    TimeStart,
    TimeStop,
    MonthDays,
    WeekDays,
    DateStart,
    DateStop,
    TimeContiguous,
    KernelTimezone,
}

/// Attributes that take no value and are emitted as a bare flag when `true`.
pub const BOOLEANS: &[Attribute] = &[
    Attribute::ChecksumFill,
    Attribute::ClampMssToPmtu,
    Attribute::Isfragment,
    Attribute::LogUid,
    Attribute::Random,
    Attribute::Rdest,
    Attribute::Reap,
    Attribute::Rsource,
    Attribute::Rttl,
    Attribute::Socket,
    Attribute::PhysdevIsBridged,
    Attribute::TimeContiguous,
    Attribute::KernelTimezone,
    Attribute::ClusteripNew,
];

/// Match modules whose options may appear together after a single `-m`.
///
/// Members are listed in the order `iptables-save` prints them.
pub const MODULE_GROUPS: &[(&str, &[Attribute])] = &[
    (
        "physdev",
        &[
            Attribute::PhysdevIn,
            Attribute::PhysdevOut,
            Attribute::PhysdevIsBridged,
        ],
    ),
    ("addrtype", &[Attribute::SrcType, Attribute::DstType]),
    ("iprange", &[Attribute::SrcRange, Attribute::DstRange]),
    ("owner", &[Attribute::Uid, Attribute::Gid]),
    (
        "time",
        &[
            Attribute::TimeStart,
            Attribute::TimeStop,
            Attribute::MonthDays,
            Attribute::WeekDays,
            Attribute::DateStart,
            Attribute::DateStop,
            Attribute::TimeContiguous,
            Attribute::KernelTimezone,
        ],
    ),
];

impl Attribute {
    /// Default flag spellings, preferred spelling first.
    ///
    /// `set_mark` is resolved per host by [`FlagMap::new`].
    pub const fn default_flags(self) -> &'static [&'static str] {
        match self {
            Attribute::Table => &["-t"],
            Attribute::Source => &["-s"],
            Attribute::Destination => &["-d"],
            Attribute::Iniface => &["-i"],
            Attribute::Outiface => &["-o"],
            Attribute::PhysdevIn => &["--physdev-in"],
            Attribute::PhysdevOut => &["--physdev-out"],
            Attribute::PhysdevIsBridged => &["--physdev-is-bridged"],
            Attribute::Proto => &["-p"],
            Attribute::Isfragment => &["-f"],
            Attribute::StatMode => &["-m statistic --mode"],
            Attribute::StatEvery => &["--every"],
            Attribute::StatPacket => &["--packet"],
            Attribute::StatProbability => &["--probability"],
            Attribute::SrcRange => &["--src-range"],
            Attribute::DstRange => &["--dst-range"],
            Attribute::TcpFlags => &["-m tcp --tcp-flags"],
            Attribute::Uid => &["--uid-owner"],
            Attribute::Gid => &["--gid-owner"],
            Attribute::MacSource => &["-m mac --mac-source", "--mac-source"],
            Attribute::Sport => &["-m multiport --sports", "--sport"],
            Attribute::Dport => &["-m multiport --dports", "--dport"],
            Attribute::Port => &["-m multiport --ports"],
            Attribute::SrcType => &["--src-type"],
            Attribute::DstType => &["--dst-type"],
            Attribute::Socket => &["-m socket"],
            Attribute::Pkttype => &["-m pkttype --pkt-type"],
            Attribute::Name => &["-m comment --comment"],
            Attribute::IpsecDir => &["-m policy --dir"],
            Attribute::IpsecPolicy => &["--pol"],
            Attribute::State => &["-m state --state"],
            Attribute::Ctstate => &["-m conntrack --ctstate"],
            Attribute::Icmp => &["-m icmp --icmp-type"],
            Attribute::Limit => &["-m limit --limit"],
            Attribute::Burst => &["--limit-burst"],
            Attribute::Length => &["-m length --length"],
            Attribute::Recent => &["-m recent"],
            Attribute::Rseconds => &["--seconds"],
            Attribute::Reap => &["--reap"],
            Attribute::Rhitcount => &["--hitcount"],
            Attribute::Rttl => &["--rttl"],
            Attribute::Rname => &["--name"],
            Attribute::Mask => &["--mask"],
            Attribute::Rsource => &["--rsource"],
            Attribute::Rdest => &["--rdest"],
            Attribute::Ipset => &["-m set --match-set"],
            Attribute::StringMatch => &["-m string --string"],
            Attribute::StringAlgo => &["--algo"],
            Attribute::StringFrom => &["--from"],
            Attribute::StringTo => &["--to"],
            Attribute::Jump => &["-j"],
            Attribute::Goto => &["-g"],
            Attribute::ClusteripNew => &["--new"],
            Attribute::ClusteripHashmode => &["--hashmode"],
            Attribute::ClusteripClustermac => &["--clustermac"],
            Attribute::ClusteripTotalNodes => &["--total-nodes"],
            Attribute::ClusteripLocalNode => &["--local-node"],
            Attribute::ClusteripHashInit => &["--hash-init"],
            Attribute::ClampMssToPmtu => &["--clamp-mss-to-pmtu"],
            Attribute::Gateway => &["--gateway"],
            Attribute::SetMss => &["--set-mss"],
            Attribute::SetDscp => &["--set-dscp"],
            Attribute::SetDscpClass => &["--set-dscp-class"],
            Attribute::Todest => &["--to-destination"],
            Attribute::Tosource => &["--to-source"],
            Attribute::Toports => &["--to-ports"],
            Attribute::To => &["--to"],
            Attribute::ChecksumFill => &["--checksum-fill"],
            Attribute::Random => &["--random"],
            Attribute::LogPrefix => &["--log-prefix"],
            Attribute::LogLevel => &["--log-level"],
            Attribute::LogUid => &["--log-uid"],
            Attribute::Reject => &["--reject-with"],
            Attribute::SetMark => &["--set-xmark"],
            Attribute::MatchMark => &["-m mark --mark"],
            Attribute::Mss => &["-m tcpmss --mss"],
            Attribute::ConnlimitAbove => &["-m connlimit --connlimit-above"],
            Attribute::ConnlimitMask => &["--connlimit-mask"],
            Attribute::Connmark => &["-m connmark --mark"],
            Attribute::TimeStart => &["--timestart"],
            Attribute::TimeStop => &["--timestop"],
            Attribute::MonthDays => &["--monthdays"],
            Attribute::WeekDays => &["--weekdays"],
            Attribute::DateStart => &["--datestart"],
            Attribute::DateStop => &["--datestop"],
            Attribute::TimeContiguous => &["--contiguous"],
            Attribute::KernelTimezone => &["--kerneltz"],
        }
    }

    pub fn is_boolean(self) -> bool {
        BOOLEANS.contains(&self)
    }

    /// Comma-joined in the dump (`;`-joined for `ipset`), held as a list.
    pub const fn is_list(self) -> bool {
        matches!(
            self,
            Attribute::Dport
                | Attribute::Sport
                | Attribute::Port
                | Attribute::State
                | Attribute::Ctstate
                | Attribute::Ipset
        )
    }

    /// Accepts a leading `!` that inverts the match.
    pub const fn is_negatable(self) -> bool {
        matches!(
            self,
            Attribute::Connmark
                | Attribute::Ctstate
                | Attribute::Destination
                | Attribute::Dport
                | Attribute::DstRange
                | Attribute::DstType
                | Attribute::Port
                | Attribute::Proto
                | Attribute::Source
                | Attribute::Sport
                | Attribute::SrcRange
                | Attribute::SrcType
                | Attribute::State
        )
    }

    /// Ranges are written `a:b` by the tool and `a-b` in rule values.
    pub const fn is_range(self) -> bool {
        matches!(
            self,
            Attribute::Dport | Attribute::Sport | Attribute::Port | Attribute::Length
        )
    }

    /// Order-insensitive lists that are kept sorted.
    pub const fn is_sorted_list(self) -> bool {
        matches!(self, Attribute::State | Attribute::Ctstate)
    }

    /// Text that must also be on the line before a flag occurrence is
    /// credited to this attribute.
    ///
    /// `--to` is spelled the same by the string match and the NETMAP target.
    pub const fn discovery_context(self) -> Option<&'static str> {
        match self {
            Attribute::StringTo => Some("-m string"),
            Attribute::To => Some("-j NETMAP"),
            _ => None,
        }
    }
}

/// Flag used to set packet marks.
///
/// `iptables` older than 1.4.1 only understands `--set-mark`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum MarkFlag {
    #[serde(rename = "--set-mark")]
    #[strum(serialize = "--set-mark")]
    SetMark,
    #[default]
    #[serde(rename = "--set-xmark")]
    #[strum(serialize = "--set-xmark")]
    SetXmark,
}

impl MarkFlag {
    /// Picks the flag supported by the given `iptables` version string.
    ///
    /// Unparseable components compare as zero.
    pub fn for_version(version: &str) -> Self {
        let parse = |v: &str| -> Vec<u32> {
            v.trim()
                .trim_start_matches('v')
                .split('.')
                .map(|part| {
                    part.chars()
                        .take_while(char::is_ascii_digit)
                        .collect::<String>()
                        .parse()
                        .unwrap_or(0)
                })
                .collect()
        };

        if parse(version) < vec![1, 4, 1] {
            MarkFlag::SetMark
        } else {
            MarkFlag::SetXmark
        }
    }
}

/// Host-dependent schema choices, resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaConfig {
    pub mark_flag: MarkFlag,
}

/// Resolved flag spellings for every attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagMap {
    flags: BTreeMap<Attribute, Vec<String>>,
}

impl FlagMap {
    pub fn new(config: &SchemaConfig) -> Self {
        use strum::IntoEnumIterator;

        let flags = Attribute::iter()
            .map(|attr| {
                let spellings = if attr == Attribute::SetMark {
                    vec![config.mark_flag.as_ref().to_string()]
                } else {
                    attr.default_flags().iter().map(|s| (*s).to_string()).collect()
                };
                (attr, spellings)
            })
            .collect();

        Self { flags }
    }

    /// All spellings for `attr`, preferred first.
    pub fn spellings(&self, attr: Attribute) -> &[String] {
        self.flags.get(&attr).map_or(&[], Vec::as_slice)
    }

    /// The spelling written by the serializer.
    pub fn preferred(&self, attr: Attribute) -> &str {
        self.spellings(attr).first().map_or("", String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &[String])> {
        self.flags.iter().map(|(attr, s)| (*attr, s.as_slice()))
    }

    /// Prefixes the module announcement onto the first member of each group
    /// for which `is_present` holds.
    pub fn expand_for_module<F>(&self, mut is_present: F) -> FlagMap
    where
        F: FnMut(Attribute, &str) -> bool,
    {
        let mut expanded = self.clone();

        for (module, members) in MODULE_GROUPS {
            for &attr in *members {
                let preferred = self.preferred(attr);
                if is_present(attr, preferred) {
                    if let Some(first) = expanded
                        .flags
                        .get_mut(&attr)
                        .and_then(|spellings| spellings.first_mut())
                    {
                        *first = format!("-m {module} {preferred}");
                    }
                    break;
                }
            }
        }

        expanded
    }

    /// Expansion against an already-rendered rule line.
    pub fn expand_for_line(&self, line: &str) -> FlagMap {
        self.expand_for_module(|_, flag| line.contains(flag))
    }

    /// Expansion against the attributes a desired rule sets.
    pub fn expand_for_values<F>(&self, mut is_set: F) -> FlagMap
    where
        F: FnMut(Attribute) -> bool,
    {
        self.expand_for_module(|attr, _| is_set(attr))
    }
}

impl Default for FlagMap {
    fn default() -> Self {
        Self::new(&SchemaConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_attribute_has_a_flag() {
        let flags = FlagMap::default();
        for attr in Attribute::iter() {
            assert!(!flags.preferred(attr).is_empty(), "{attr} has no flag");
        }
        assert_eq!(Attribute::iter().count(), 87);
    }

    #[test]
    fn test_canonical_order_follows_declaration() {
        let order: Vec<Attribute> = Attribute::iter().collect();
        let pos = |a| order.iter().position(|x| *x == a).unwrap();
        assert!(pos(Attribute::Table) < pos(Attribute::Source));
        assert!(pos(Attribute::Proto) < pos(Attribute::Dport));
        assert!(pos(Attribute::Name) < pos(Attribute::State));
        assert!(pos(Attribute::Jump) < pos(Attribute::LogPrefix));
        assert!(Attribute::Source < Attribute::Destination);
    }

    #[test]
    fn test_attribute_names_are_snake_case() {
        assert_eq!(Attribute::PhysdevIsBridged.as_ref(), "physdev_is_bridged");
        assert_eq!(Attribute::StringMatch.as_ref(), "string");
        assert_eq!(
            "clusterip_hash_init".parse::<Attribute>().unwrap(),
            Attribute::ClusteripHashInit
        );
        let json = serde_json::to_string(&Attribute::SetDscpClass).unwrap();
        assert_eq!(json, "\"set_dscp_class\"");
    }

    #[test]
    fn test_mark_flag_for_version() {
        assert_eq!(MarkFlag::for_version("1.4.0"), MarkFlag::SetMark);
        assert_eq!(MarkFlag::for_version("1.3.8"), MarkFlag::SetMark);
        assert_eq!(MarkFlag::for_version("1.4.1"), MarkFlag::SetXmark);
        assert_eq!(MarkFlag::for_version("v1.8.7"), MarkFlag::SetXmark);
        assert_eq!(MarkFlag::for_version("1.4.21"), MarkFlag::SetXmark);
    }

    #[test]
    fn test_mark_flag_is_configurable() {
        let legacy = FlagMap::new(&SchemaConfig {
            mark_flag: MarkFlag::SetMark,
        });
        assert_eq!(legacy.preferred(Attribute::SetMark), "--set-mark");
        assert_eq!(
            FlagMap::default().preferred(Attribute::SetMark),
            "--set-xmark"
        );
    }

    #[test]
    fn test_expand_for_line_prefixes_first_present_member() {
        let flags = FlagMap::default();
        let line = "-A OUTPUT -m owner --uid-owner 0 --gid-owner 0 -j ACCEPT";
        let expanded = flags.expand_for_line(line);

        assert_eq!(expanded.preferred(Attribute::Uid), "-m owner --uid-owner");
        assert_eq!(expanded.preferred(Attribute::Gid), "--gid-owner");
    }

    #[test]
    fn test_expand_for_line_skips_absent_members() {
        let flags = FlagMap::default();
        let line = "-A OUTPUT -m owner --gid-owner 100 -j ACCEPT";
        let expanded = flags.expand_for_line(line);

        assert_eq!(expanded.preferred(Attribute::Uid), "--uid-owner");
        assert_eq!(expanded.preferred(Attribute::Gid), "-m owner --gid-owner");
    }

    #[test]
    fn test_expand_for_values_uses_group_order() {
        let flags = FlagMap::default();
        let expanded = flags.expand_for_values(|attr| {
            matches!(attr, Attribute::WeekDays | Attribute::TimeStop)
        });

        assert_eq!(
            expanded.preferred(Attribute::TimeStop),
            "-m time --timestop"
        );
        assert_eq!(expanded.preferred(Attribute::WeekDays), "--weekdays");
        assert_eq!(expanded.preferred(Attribute::Uid), "--uid-owner");
    }

    #[test]
    fn test_expansion_keeps_alternate_spellings() {
        let flags = FlagMap::default();
        assert_eq!(
            flags.spellings(Attribute::Dport),
            ["-m multiport --dports", "--dport"]
        );
    }
}
