//! Generated system files: systemd units, rsyslog routing, logrotate policy.
//!
//! All names and paths come from [`Config`], so a renamed chain or set shows
//! up consistently in every generated file.

use std::path::Path;

use crate::config::Config;
use crate::enforcer::Family;

pub const IPSET_RESTORE_UNIT: &str = "antiscan-ipset-restore.service";
pub const MOVE_RULES_UNIT: &str = "antiscan-move-rules.service";
pub const AGGREGATE_SERVICE_UNIT: &str = "antiscan-aggregate.service";
pub const AGGREGATE_TIMER_UNIT: &str = "antiscan-aggregate.timer";

/// Restores the saved sets at boot, before UFW or netfilter-persistent load
/// rules that reference them.
pub fn ipset_restore_unit(config: &Config) -> String {
    let chain = &config.names.chain;
    format!(
        r#"[Unit]
Description=Restore antiscan ipset configuration
Before=ufw.service
Before=netfilter-persistent.service
DefaultDependencies=no

[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart=/usr/sbin/ipset restore -exist -f {ipset_conf}
ExecStart=-/usr/sbin/iptables -N {chain}
ExecStart=-/usr/sbin/ip6tables -N {chain}

[Install]
WantedBy=multi-user.target
RequiredBy=netfilter-persistent.service
"#,
        ipset_conf = config.paths.ipset_conf.display(),
        chain = chain,
    )
}

/// Moves the block chain's hook back to position 1 after UFW has loaded.
pub fn move_rules_unit(config: &Config) -> String {
    let chain = &config.names.chain;
    let mut exec = String::new();
    for family in Family::ALL {
        let cmd = family.iptables_cmd();
        let ufw_chain = config.names.ufw_input_chain(family);
        exec.push_str(&format!(
            "ExecStart=-/usr/sbin/{cmd} -D {ufw_chain} -j {chain}\n\
             ExecStart=/usr/sbin/{cmd} -I {ufw_chain} 1 -j {chain}\n"
        ));
    }

    format!(
        r#"[Unit]
Description=Move antiscan rules to position 1 in UFW chains
After=ufw.service
After=network.target

[Service]
Type=oneshot
RemainAfterExit=yes
ExecStart=/bin/sleep 2
{exec}
[Install]
WantedBy=multi-user.target
"#
    )
}

pub fn aggregate_service_unit(binary: &Path) -> String {
    format!(
        r#"[Unit]
Description=antiscan log aggregator
After=rsyslog.service

[Service]
Type=oneshot
ExecStart={binary} aggregate
StandardOutput=journal
StandardError=journal
"#,
        binary = binary.display()
    )
}

pub fn aggregate_timer_unit() -> String {
    format!(
        r#"[Unit]
Description=antiscan log aggregator timer
Requires={AGGREGATE_SERVICE_UNIT}

[Timer]
OnBootSec=1min
OnUnitActiveSec=30sec
AccuracySec=5sec

[Install]
WantedBy=timers.target
"#
    )
}

/// Routes each family's LOG prefix to its own file and stops further processing.
pub fn rsyslog_config(config: &Config) -> String {
    let mut out = String::new();
    for family in Family::ALL {
        out.push_str(&format!(
            ":msg, contains, \"{}\" {}\n",
            config.names.log_prefix(family),
            config.paths.raw_log(family).display()
        ));
    }
    out.push_str("& stop\n");
    out
}

pub fn logrotate_config(config: &Config) -> String {
    let mut out = String::new();
    for family in Family::ALL {
        out.push_str(&format!(
            r#"{} {{
    daily
    rotate 7
    compress
    delaycompress
    missingok
    notifempty
    create 0640 root adm
    sharedscripts
    postrotate
        /usr/lib/rsyslog/rsyslog-rotate
    endscript
}}

"#,
            config.paths.raw_log(family).display()
        ));
    }
    out.push_str(&format!(
        r#"{} {{
    weekly
    rotate 4
    compress
    delaycompress
    missingok
    notifempty
    create 0640 root adm
}}
"#,
        config.paths.aggregate_csv.display()
    ));
    out
}
