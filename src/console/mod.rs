//! Unit-test console.
//!
//! Lines take the form `ut <module_id> <cmd_id> <argc> [args…]`. Numbers
//! accept decimal or `0x` hex. Each module owns a command table; modules
//! without one answer `NotFound`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::composition::ElementType;
use crate::control::{system, to_ble, Code};
use crate::elements::{ElementBlock, ElementCtx};
use crate::error::{MeshxError, Result};
use crate::logutil::{escape_log, hex_preview};
use crate::models::{arg_bmap, BleRequest, MSG_GET, MSG_SET};
use crate::node::Device;
use crate::os::{OsTimer, TimerCallback};
use crate::port::LightCtlParams;

pub mod module_id {
    pub const RELAY_CLIENT: u32 = 0;
    pub const CWWW_CLIENT: u32 = 1;
    pub const OS_TIMER: u32 = 2;
    pub const NVS: u32 = 3;
    pub const RELAY_SERVER: u32 = 4;
    pub const CWWW_SERVER: u32 = 5;
}

pub mod nvs_cmd {
    pub const OPEN: u32 = 0;
    pub const SET: u32 = 1;
    pub const GET: u32 = 2;
    pub const COMMIT: u32 = 3;
    pub const REMOVE: u32 = 4;
    pub const ERASE: u32 = 5;
    pub const CLOSE: u32 = 6;
}

pub mod timer_cmd {
    pub const CREATE: u32 = 0;
    pub const ARM: u32 = 1;
    pub const REARM: u32 = 2;
    pub const DISARM: u32 = 3;
    pub const DELETE: u32 = 4;
    pub const PERIOD_SET: u32 = 5;
}

pub mod relay_cli_cmd {
    pub const GET: u32 = 0;
    pub const SET: u32 = 1;
    pub const SET_UNACK: u32 = 2;
}

pub mod cwww_cli_cmd {
    pub const ONOFF_GET: u32 = 0;
    pub const ONOFF_SET: u32 = 1;
    pub const ONOFF_SET_UNACK: u32 = 2;
    pub const CTL_GET: u32 = 3;
    pub const CTL_SET: u32 = 4;
    pub const CTL_SET_UNACK: u32 = 5;
    pub const TEMPERATURE_RANGE_SET: u32 = 12;
    pub const TEMPERATURE_RANGE_SET_UNACK: u32 = 13;
}

pub const UT_TIMER_NAME: &str = "ut_timer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtCommand {
    pub module: u32,
    pub cmd: u32,
    pub args: Vec<String>,
}

impl UtCommand {
    fn arg(&self, i: usize) -> Result<&str> {
        self.args
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| MeshxError::invalid_arg(format!("missing argument {}", i)))
    }

    fn num(&self, i: usize) -> Result<u32> {
        parse_num(self.arg(i)?)
    }

    fn num_u16(&self, i: usize) -> Result<u16> {
        let v = self.num(i)?;
        u16::try_from(v).map_err(|_| MeshxError::invalid_arg(format!("{} does not fit 16 bits", v)))
    }

    fn opt_num(&self, i: usize) -> Result<Option<u32>> {
        self.args.get(i).map(|a| parse_num(a)).transpose()
    }
}

pub fn parse_num(token: &str) -> Result<u32> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => token.parse::<u32>(),
    };
    parsed.map_err(|_| MeshxError::invalid_arg(format!("'{}' is not a number", escape_log(token).limit(32))))
}

/// Split one console line into a command.
pub fn parse_ut(line: &str) -> Result<UtCommand> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return Err(MeshxError::invalid_arg(format!(
            "usage: ut <module_id> <cmd_id> <argc> [args…] (got '{}')",
            escape_log(line)
        )));
    }
    if tokens[0] != "ut" {
        return Err(MeshxError::NotFound(format!("command '{}'", escape_log(tokens[0]))));
    }
    let module = parse_num(tokens[1])?;
    let cmd = parse_num(tokens[2])?;
    let argc = parse_num(tokens[3])? as usize;
    let supplied = tokens.len() - 4;
    if argc > supplied {
        return Err(MeshxError::invalid_arg(format!(
            "argc {} but only {} argument(s) given",
            argc, supplied
        )));
    }
    Ok(UtCommand {
        module,
        cmd,
        args: tokens[4..4 + argc].iter().map(|s| s.to_string()).collect(),
    })
}

fn unknown_cmd(module: &str, cmd: u32) -> MeshxError {
    MeshxError::NotFound(format!("{} command {}", module, cmd))
}

pub struct Console {
    dev: Arc<Device>,
    timer: Option<OsTimer>,
}

impl Console {
    pub fn new(dev: Arc<Device>) -> Self {
        Self { dev, timer: None }
    }

    pub fn execute(&mut self, line: &str) -> Result<String> {
        let cmd = parse_ut(line)?;
        debug!("console: {}", escape_log(line.trim()));
        let out = match cmd.module {
            module_id::NVS => self.nvs(&cmd),
            module_id::OS_TIMER => self.os_timer(&cmd),
            module_id::RELAY_CLIENT => self.relay_client(&cmd),
            module_id::CWWW_CLIENT => self.cwww_client(&cmd),
            other => Err(MeshxError::NotFound(format!("console module {}", other))),
        }?;
        info!("ut {} {} -> {}", cmd.module, cmd.cmd, escape_log(&out));
        Ok(out)
    }

    fn nvs(&mut self, cmd: &UtCommand) -> Result<String> {
        let nvs = &self.dev.nvs;
        match cmd.cmd {
            nvs_cmd::OPEN => {
                let stability = match cmd.opt_num(0)? {
                    Some(ms) => ms,
                    None => self.dev.config.nvs.save_period_ms,
                };
                nvs.open(self.dev.config.device.cid, self.dev.config.device.pid, stability)?;
                Ok(format!("opened, stability {} ms", stability))
            }
            nvs_cmd::SET => {
                let key = cmd.arg(0)?;
                let value = cmd.num(1)?;
                let arm = cmd.opt_num(2)?.map(|a| a != 0).unwrap_or(true);
                nvs.set(key, &value.to_le_bytes(), arm)?;
                Ok(format!("{} = {}", key, value))
            }
            nvs_cmd::GET => {
                let key = cmd.arg(0)?;
                let blob = nvs.get(key)?;
                match <[u8; 4]>::try_from(blob.as_slice()) {
                    Ok(raw) => Ok(format!("{} = {}", key, u32::from_le_bytes(raw))),
                    Err(_) => Ok(format!("{} = [{}]", key, hex_preview(&blob))),
                }
            }
            nvs_cmd::COMMIT => nvs.commit().map(|_| "committed".to_string()),
            nvs_cmd::REMOVE => {
                let key = cmd.arg(0)?;
                nvs.remove(key)?;
                Ok(format!("removed {}", key))
            }
            nvs_cmd::ERASE => nvs.erase().map(|_| "erased".to_string()),
            nvs_cmd::CLOSE => nvs.close().map(|_| "closed".to_string()),
            other => Err(unknown_cmd("nvs", other)),
        }
    }

    fn timer(&self) -> Result<&OsTimer> {
        self.timer
            .as_ref()
            .ok_or_else(|| MeshxError::invalid_state("no console timer, create one first"))
    }

    fn os_timer(&mut self, cmd: &UtCommand) -> Result<String> {
        match cmd.cmd {
            timer_cmd::CREATE => {
                if self.timer.is_some() {
                    return Err(MeshxError::invalid_state("console timer already exists"));
                }
                let period = Duration::from_millis(u64::from(cmd.num(0)?));
                let auto_reload = cmd.num(1)? != 0;
                let bus = Arc::downgrade(&self.dev.bus);
                let on_fire: TimerCallback = Arc::new(move |name: &str| {
                    info!("{} fired", name);
                    if let Some(bus) = bus.upgrade() {
                        if let Err(e) = bus.try_publish(Code::System, system::TIMER_FIRE, &[]) {
                            debug!("{}: fire event dropped: {}", name, e);
                        }
                    }
                });
                self.timer = Some(self.dev.timers.create(UT_TIMER_NAME, period, auto_reload, on_fire)?);
                Ok(format!("created {:?} reload={}", period, auto_reload))
            }
            timer_cmd::ARM => self.timer()?.start().map(|_| "armed".to_string()),
            timer_cmd::REARM => self.timer()?.reset().map(|_| "rearmed".to_string()),
            timer_cmd::DISARM => self.timer()?.stop().map(|_| "disarmed".to_string()),
            timer_cmd::DELETE => {
                let timer = self
                    .timer
                    .take()
                    .ok_or_else(|| MeshxError::invalid_state("no console timer"))?;
                timer.delete()?;
                Ok("deleted".to_string())
            }
            timer_cmd::PERIOD_SET => {
                let period = Duration::from_millis(u64::from(cmd.num(0)?));
                self.timer()?.change_period(period)?;
                Ok(format!("period {:?}", period))
            }
            other => Err(unknown_cmd("timer", other)),
        }
    }

    fn client_ctx(&self, element_type: ElementType, element_id: u16) -> Result<ElementCtx> {
        self.dev
            .elements()
            .iter()
            .filter(|b: &&Arc<ElementBlock>| b.element_type() == element_type)
            .find_map(|b| b.ctx(element_id))
            .ok_or_else(|| MeshxError::NotFound(format!("{} element {}", element_type, element_id)))
    }

    fn post(&self, evt: u32, req: &BleRequest) -> Result<String> {
        self.dev.bus.try_publish_value(Code::ToBle, evt, req)?;
        Ok(format!("queued request for element {}", req.element_id))
    }

    fn relay_client(&mut self, cmd: &UtCommand) -> Result<String> {
        let el = cmd.num_u16(0)?;
        let ctx = self.client_ctx(ElementType::RelayClient, el)?;
        let toggled = u8::from(ctx.on_off == 0);
        let req = match cmd.cmd {
            relay_cli_cmd::GET => BleRequest::onoff(el, MSG_GET, true, 0),
            relay_cli_cmd::SET => BleRequest::onoff(el, MSG_SET, true, toggled),
            relay_cli_cmd::SET_UNACK => BleRequest::onoff(el, MSG_SET, false, toggled),
            other => return Err(unknown_cmd("relay client", other)),
        };
        self.post(to_ble::SET_ON_OFF, &req)
    }

    fn cwww_client(&mut self, cmd: &UtCommand) -> Result<String> {
        let el = cmd.num_u16(0)?;
        let ctx = self.client_ctx(ElementType::CwwwClient, el)?;
        let toggled = u8::from(ctx.on_off == 0);
        let ctl_req = |set_get: u8, ack: bool, bmap: u8, ctl: LightCtlParams| BleRequest {
            element_id: el,
            set_get,
            ack,
            arg_bmap: bmap,
            on_off: ctx.on_off,
            ctl,
        };
        match cmd.cmd {
            cwww_cli_cmd::ONOFF_GET => self.post(to_ble::SET_ON_OFF, &BleRequest::onoff(el, MSG_GET, true, 0)),
            cwww_cli_cmd::ONOFF_SET => self.post(to_ble::SET_ON_OFF, &BleRequest::onoff(el, MSG_SET, true, toggled)),
            cwww_cli_cmd::ONOFF_SET_UNACK => {
                self.post(to_ble::SET_ON_OFF, &BleRequest::onoff(el, MSG_SET, false, toggled))
            }
            cwww_cli_cmd::CTL_GET => self.post(to_ble::SET_CTL, &ctl_req(MSG_GET, true, arg_bmap::CTL_SET, ctx.ctl)),
            cwww_cli_cmd::CTL_SET | cwww_cli_cmd::CTL_SET_UNACK => {
                let ctl = LightCtlParams {
                    temperature: cmd.num_u16(1)?,
                    lightness: cmd.num_u16(2)?,
                    delta_uv: cmd.num_u16(3)?,
                    ..ctx.ctl
                };
                let ack = cmd.cmd == cwww_cli_cmd::CTL_SET;
                self.post(to_ble::SET_CTL, &ctl_req(MSG_SET, ack, arg_bmap::CTL_SET, ctl))
            }
            cwww_cli_cmd::TEMPERATURE_RANGE_SET | cwww_cli_cmd::TEMPERATURE_RANGE_SET_UNACK => {
                let ctl = LightCtlParams {
                    range_min: cmd.num_u16(1)?,
                    range_max: cmd.num_u16(2)?,
                    ..ctx.ctl
                };
                let ack = cmd.cmd == cwww_cli_cmd::TEMPERATURE_RANGE_SET;
                self.post(
                    to_ble::SET_CTL,
                    &ctl_req(MSG_SET, ack, arg_bmap::TEMPERATURE_RANGE_SET, ctl),
                )
            }
            other => Err(unknown_cmd("cwww client", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_command_and_args() {
        let cmd = parse_ut("ut 3 1 3 key 0x2A 0").unwrap();
        assert_eq!(cmd.module, module_id::NVS);
        assert_eq!(cmd.cmd, nvs_cmd::SET);
        assert_eq!(cmd.args, vec!["key", "0x2A", "0"]);
        assert_eq!(cmd.num(1).unwrap(), 42);
    }

    #[test]
    fn extra_tokens_beyond_argc_are_ignored() {
        let cmd = parse_ut("ut 2 1 0 stray").unwrap();
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn short_lines_and_overstated_argc_are_rejected() {
        assert!(matches!(parse_ut("ut 3 1"), Err(MeshxError::InvalidArg(_))));
        assert!(matches!(parse_ut("ut 3 1 2 key"), Err(MeshxError::InvalidArg(_))));
        assert!(matches!(parse_ut("ut x 1 0"), Err(MeshxError::InvalidArg(_))));
    }

    #[test]
    fn non_ut_lines_are_unknown() {
        assert!(matches!(parse_ut("help me now please"), Err(MeshxError::NotFound(_))));
    }

    #[test]
    fn parse_num_accepts_hex_and_decimal() {
        assert_eq!(parse_num("0x1F40").unwrap(), 0x1F40);
        assert_eq!(parse_num("8000").unwrap(), 8000);
        assert!(parse_num("-1").is_err());
    }
}
