//! Core domain types shared across the engine
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum BloodType {
    #[n(0)]
    OPos,
    #[n(1)]
    ONeg,
    #[n(2)]
    APos,
    #[n(3)]
    ANeg,
    #[n(4)]
    BPos,
    #[n(5)]
    BNeg,
    #[n(6)]
    AbPos,
    #[n(7)]
    AbNeg,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum Component {
    #[n(0)]
    WholeBlood,
    #[n(1)]
    RedBloodCells,
    #[n(2)]
    Platelets,
    #[n(3)]
    FreshFrozenPlasma,
    #[n(4)]
    Cryoprecipitate,
    #[n(5)]
    SingleDonorPlatelets,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum Urgency {
    #[n(0)]
    Routine,
    #[n(1)]
    Urgent,
    #[n(2)]
    Emergency,
}

impl BloodType {
    pub const ALL: [BloodType; 8] = [
        BloodType::OPos,
        BloodType::ONeg,
        BloodType::APos,
        BloodType::ANeg,
        BloodType::BPos,
        BloodType::BNeg,
        BloodType::AbPos,
        BloodType::AbNeg,
    ];

    /// Red-cell donor compatibility: can a recipient of this type
    /// receive a unit drawn from `donor`?
    pub fn can_receive_from(self, donor: BloodType) -> bool {
        use BloodType::*;
        match self {
            ONeg => matches!(donor, ONeg),
            OPos => matches!(donor, ONeg | OPos),
            ANeg => matches!(donor, ONeg | ANeg),
            APos => matches!(donor, ONeg | OPos | ANeg | APos),
            BNeg => matches!(donor, ONeg | BNeg),
            BPos => matches!(donor, ONeg | OPos | BNeg | BPos),
            AbNeg => matches!(donor, ONeg | ANeg | BNeg | AbNeg),
            AbPos => true,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            BloodType::OPos => "O+",
            BloodType::ONeg => "O-",
            BloodType::APos => "A+",
            BloodType::ANeg => "A-",
            BloodType::BPos => "B+",
            BloodType::BNeg => "B-",
            BloodType::AbPos => "AB+",
            BloodType::AbNeg => "AB-",
        }
    }
}

impl Component {
    /// Shelf life applied when a unit passes QA.
    pub fn shelf_life_days(self) -> i64 {
        match self {
            Component::WholeBlood => 35,
            Component::RedBloodCells => 42,
            Component::Platelets => 5,
            Component::FreshFrozenPlasma => 365,
            Component::Cryoprecipitate => 365,
            Component::SingleDonorPlatelets => 5,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Component::WholeBlood => "WB",
            Component::RedBloodCells => "RBC",
            Component::Platelets => "PLT",
            Component::FreshFrozenPlasma => "FFP",
            Component::Cryoprecipitate => "CRYO",
            Component::SingleDonorPlatelets => "SDP",
        }
    }
}

impl std::fmt::Display for BloodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// derived impls would demand the ordering traits of `T` itself, which
// zone types like `Utc` do not carry; compare the instants directly
impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Copy for TimeStamp<Utc> {}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Into::into)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus_days(self, days: i64) -> Self {
        Self(self.0 + chrono::Duration::days(days))
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
