#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
pub enum ControllerModel {
    Optima270,
    Optima251,
}

impl std::fmt::Display for ControllerModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ControllerModel::Optima270 => "Optima 270",
            ControllerModel::Optima251 => "Optima 251",
        })
    }
}

/// A read-only register exposing a sensor value.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Datapoint {
    pub key: &'static str,
    /// Display name; the value cache and `data` events key on this.
    pub name: &'static str,
    pub capability: &'static str,
    pub obj: u8,
    pub address: u32,
    pub divider: i32,
    pub offset: i32,
    pub unit: &'static str,
}

/// A read/write register exposing a control value. Read and write
/// addresses differ on some firmware families; `min`/`max` bound the raw
/// encoding, not the display value.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Setpoint {
    pub key: &'static str,
    pub name: &'static str,
    pub capability: &'static str,
    pub obj: u8,
    pub read_address: u16,
    pub write_address: u16,
    pub divider: i32,
    pub offset: i32,
    pub min: i32,
    pub max: i32,
    pub unit: &'static str,
    pub write_only: bool,
}

pub fn convert_datapoint_value(raw: i16, reg: &Datapoint) -> f32 {
    to_display(i32::from(raw), reg.divider, reg.offset)
}

pub fn convert_setpoint_value(raw: u16, reg: &Setpoint) -> f32 {
    to_display(i32::from(raw), reg.divider, reg.offset)
}

pub fn to_raw_setpoint_value(display: f32, reg: &Setpoint) -> i32 {
    let divider = if reg.divider == 0 { 1 } else { reg.divider };
    (display * divider as f32).round() as i32 - reg.offset
}

fn to_display(raw: i32, divider: i32, offset: i32) -> f32 {
    let divider = if divider == 0 { 1 } else { divider };
    (raw + offset) as f32 / divider as f32
}

/// One controller family's ordered register tables. Order is load-bearing:
/// read replies are positional, so the request list index is the only
/// association between a value and its register.
pub struct Catalog {
    pub model: ControllerModel,
    pub datapoints: &'static [Datapoint],
    pub setpoints: &'static [Setpoint],
}

impl Catalog {
    pub fn for_model(model: ControllerModel) -> &'static Catalog {
        match model {
            ControllerModel::Optima270 => &optima270::CATALOG,
            ControllerModel::Optima251 => &optima251::CATALOG,
        }
    }

    pub fn datapoint_request_list(&self) -> Vec<(u8, u32)> {
        self.datapoints
            .iter()
            .map(|reg| (reg.obj, reg.address))
            .collect()
    }

    /// Setpoints that answer reads, in catalog order. Write-only entries
    /// (filter reset) would stall the reply and are skipped.
    pub fn readable_setpoints(&self) -> impl Iterator<Item = &'static Setpoint> {
        self.setpoints.iter().filter(|reg| !reg.write_only)
    }

    pub fn setpoint_request_list(&self) -> Vec<(u8, u16)> {
        self.readable_setpoints()
            .map(|reg| (reg.obj, reg.read_address))
            .collect()
    }

    pub fn setpoint_by_name(&self, name: &str) -> Option<&'static Setpoint> {
        self.setpoints.iter().find(|reg| reg.name == name)
    }

    pub fn datapoint_by_name(&self, name: &str) -> Option<&'static Datapoint> {
        self.datapoints.iter().find(|reg| reg.name == name)
    }
}

macro_rules! datapoint_list {
    ($($key:ident: $obj:literal / $addr:literal, div = $div:literal, off = $off:literal,
        $unit:literal, $name:literal, $cap:literal;)+) => {
        &[$(Datapoint {
            key: stringify!($key),
            obj: $obj,
            address: $addr,
            divider: $div,
            offset: $off,
            unit: $unit,
            name: $name,
            capability: $cap,
        }),+]
    };
}

macro_rules! write_only {
    () => {
        false
    };
    (write_only) => {
        true
    };
}

macro_rules! setpoint_list {
    ($($key:ident: $obj:literal / $read:literal -> $write:literal, div = $div:literal, off = $off:literal,
        min = $min:literal, max = $max:literal, $unit:literal, $name:literal, $cap:literal $(, $wo:ident)?;)+) => {
        &[$(Setpoint {
            key: stringify!($key),
            obj: $obj,
            read_address: $read,
            write_address: $write,
            divider: $div,
            offset: $off,
            min: $min,
            max: $max,
            unit: $unit,
            name: $name,
            capability: $cap,
            write_only: write_only!($($wo)?),
        }),+]
    };
}

pub mod optima270 {
    use super::{Catalog, ControllerModel, Datapoint, Setpoint};

    pub static CATALOG: Catalog = Catalog {
        model: ControllerModel::Optima270,
        datapoints: DATAPOINTS,
        setpoints: SETPOINTS,
    };

    const DATAPOINTS: &[Datapoint] = datapoint_list! {
        TEMP_SUPPLY:       0 / 20,  div = 10, off = -300, "°C",  "supplyTemperature",   "measure_temperature.supply";
        TEMP_OUTSIDE:      0 / 21,  div = 10, off = -300, "°C",  "outsideTemperature",  "measure_temperature.outside";
        TEMP_EXHAUST:      0 / 22,  div = 10, off = -300, "°C",  "exhaustTemperature",  "measure_temperature.exhaust";
        TEMP_EXTRACT:      0 / 23,  div = 10, off = -300, "°C",  "extractTemperature",  "measure_temperature.extract";
        HUMIDITY:          0 / 26,  div = 1,  off = 0,    "%",   "humidity",            "measure_humidity";
        DUTYCYCLE_SUPPLY:  0 / 18,  div = 1,  off = 0,    "%",   "supplyFanDutycycle",  "measure_fan_duty.supply";
        DUTYCYCLE_EXTRACT: 0 / 19,  div = 1,  off = 0,    "%",   "extractFanDutycycle", "measure_fan_duty.extract";
        RPM_SUPPLY:        0 / 35,  div = 1,  off = 0,    "rpm", "supplyFanRpm",        "measure_rpm.supply";
        RPM_EXTRACT:       0 / 36,  div = 1,  off = 0,    "rpm", "extractFanRpm",       "measure_rpm.extract";
        BYPASS_ACTIVE:     0 / 53,  div = 1,  off = 0,    "",    "bypassActive",        "alarm_bypass";
        FILTER_DAYS:       0 / 100, div = 1,  off = 0,    "d",   "filterDays",          "measure_filter_days";
        // Shares slot 18 with DUTYCYCLE_SUPPLY; which meaning applies is
        // firmware-dependent, so both are surfaced and read identically.
        SACRIFICIAL_ANODE: 0 / 18,  div = 1,  off = 0,    "",    "sacrificialAnode",    "alarm_anode";
    };

    const SETPOINTS: &[Setpoint] = setpoint_list! {
        FAN_SPEED:     0 / 7 -> 24, div = 1,  off = 0,   min = 1, max = 4,   "",   "fanLevel",            "fan_level";
        TEMP_SETPOINT: 0 / 1 -> 12, div = 10, off = 100, min = 0, max = 200, "°C", "temperatureSetpoint", "target_temperature";
        REHEAT_ENABLE: 0 / 3 -> 14, div = 1,  off = 0,   min = 0, max = 1,   "",   "reheatEnable",        "onoff.reheat";
        FILTER_MONTHS: 0 / 5 -> 16, div = 1,  off = 0,   min = 0, max = 12,  "mo", "filterMonths",        "filter_months";
    };
}

pub mod optima251 {
    use super::{Catalog, ControllerModel, Datapoint, Setpoint};

    pub static CATALOG: Catalog = Catalog {
        model: ControllerModel::Optima251,
        datapoints: DATAPOINTS,
        setpoints: SETPOINTS,
    };

    const DATAPOINTS: &[Datapoint] = datapoint_list! {
        TEMP_SUPPLY:       0 / 0,  div = 10, off = -300, "°C",  "supplyTemperature",   "measure_temperature.supply";
        TEMP_OUTSIDE:      0 / 1,  div = 10, off = -300, "°C",  "outsideTemperature",  "measure_temperature.outside";
        TEMP_EXHAUST:      0 / 2,  div = 10, off = -300, "°C",  "exhaustTemperature",  "measure_temperature.exhaust";
        TEMP_EXTRACT:      0 / 3,  div = 10, off = -300, "°C",  "extractTemperature",  "measure_temperature.extract";
        DUTYCYCLE_SUPPLY:  0 / 6,  div = 1,  off = 0,    "%",   "supplyFanDutycycle",  "measure_fan_duty.supply";
        DUTYCYCLE_EXTRACT: 0 / 7,  div = 1,  off = 0,    "%",   "extractFanDutycycle", "measure_fan_duty.extract";
        HUMIDITY:          0 / 8,  div = 1,  off = 0,    "%",   "humidity",            "measure_humidity";
        BYPASS_ACTIVE:     0 / 12, div = 1,  off = 0,    "",    "bypassActive",        "alarm_bypass";
        RPM_SUPPLY:        0 / 20, div = 1,  off = 0,    "rpm", "supplyFanRpm",        "measure_rpm.supply";
        RPM_EXTRACT:       0 / 21, div = 1,  off = 0,    "rpm", "extractFanRpm",       "measure_rpm.extract";
        FILTER_DAYS:       0 / 23, div = 1,  off = 0,    "d",   "filterDays",          "measure_filter_days";
    };

    // Read and write addresses coincide on this family.
    const SETPOINTS: &[Setpoint] = setpoint_list! {
        FAN_SPEED:     0 / 100 -> 100, div = 1,  off = 0,   min = 0, max = 4,   "",   "fanLevel",            "fan_level";
        TEMP_SETPOINT: 0 / 101 -> 101, div = 10, off = 100, min = 0, max = 200, "°C", "temperatureSetpoint", "target_temperature";
        REHEAT_ENABLE: 0 / 102 -> 102, div = 1,  off = 0,   min = 0, max = 1,   "",   "reheatEnable",        "onoff.reheat";
        FILTER_RESET:  0 / 105 -> 105, div = 1,  off = 0,   min = 1, max = 1,   "",   "filterReset",         "button.filter_reset", write_only;
    };
}
