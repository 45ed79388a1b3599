use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteName {
    None,
    R1A,
    R10,
    R11,
    R13,
    R132,
    R133,
    R137,
    R139,
}

impl RouteName {
    pub const ALL: [RouteName; 9] = [
        RouteName::None,
        RouteName::R1A,
        RouteName::R10,
        RouteName::R11,
        RouteName::R13,
        RouteName::R132,
        RouteName::R133,
        RouteName::R137,
        RouteName::R139,
    ];

    /// Every real route, i.e. `ALL` without `None`.
    pub fn served() -> &'static [RouteName] {
        &Self::ALL[1..]
    }

    pub fn name(self) -> &'static str {
        match self {
            RouteName::None => "None",
            RouteName::R1A => "R1A",
            RouteName::R10 => "R10",
            RouteName::R11 => "R11",
            RouteName::R13 => "R13",
            RouteName::R132 => "R132",
            RouteName::R133 => "R133",
            RouteName::R137 => "R137",
            RouteName::R139 => "R139",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|r| r.name().eq_ignore_ascii_case(name))
    }

    pub fn is_none(self) -> bool {
        self == RouteName::None
    }
}

impl Default for RouteName {
    fn default() -> Self {
        RouteName::None
    }
}

impl core::fmt::Display for RouteName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Static route reference data. The simulation never writes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: RouteName,
    pub description: String,
    pub distance_km: f64,
    pub estimated_minutes: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Parses `name;description;distance_km;minutes` lines.
    ///
    /// Lines with fewer than four fields are skipped. Unparsable fields fall
    /// back to `RouteName::None`, `0.0` and `0`.
    pub fn from_records(text: &str) -> Self {
        let routes = text
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split(';').collect();
                if parts.len() < 4 {
                    return None;
                }
                Some(Route {
                    name: RouteName::from_name(parts[0]).unwrap_or_default(),
                    description: parts[1].trim().to_string(),
                    distance_km: parts[2]
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|d| d.is_finite() && *d >= 0.0)
                        .unwrap_or(0.0),
                    estimated_minutes: parts[3].trim().parse().unwrap_or(0),
                })
            })
            .collect();
        Self { routes }
    }

    pub fn get(&self, name: RouteName) -> Option<&Route> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: RouteName) -> bool {
        self.get(name).is_some()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Reference network used when no route file is supplied.
pub fn default_routes() -> RouteTable {
    const DEFAULTS: [(RouteName, &str, f64, u32); 8] = [
        (RouteName::R1A, "Avedøre Holme - Klampenborg", 24.5, 78),
        (RouteName::R10, "Københavns Hbt. - Husum Torv", 11.2, 41),
        (RouteName::R11, "Nørreport St. - Nørreport St. (ring)", 6.8, 33),
        (RouteName::R13, "Bellahøj - Hovedbanegården", 9.4, 36),
        (RouteName::R132, "Friheden St. - Hvidovre Hospital", 13.1, 44),
        (RouteName::R133, "Valby St. - Hvidovre Hospital", 10.6, 38),
        (RouteName::R137, "Brøndby Strand - Ishøj St.", 15.3, 47),
        (RouteName::R139, "Ishøj St. - Vallensbæk St.", 8.9, 29),
    ];

    RouteTable::new(
        DEFAULTS
            .iter()
            .map(|&(name, description, distance_km, estimated_minutes)| Route {
                name,
                description: description.to_string(),
                distance_km,
                estimated_minutes,
            })
            .collect(),
    )
}
