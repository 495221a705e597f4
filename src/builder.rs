use crate::{
    bus::Bus,
    cache::CoherentCache,
    config::{self, Config, Error, Errors, Section},
    mem_obj::{Dummy, Object, ObjectId},
    memory::Memory,
    sync::{Arc, Mutex},
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// How a device is shared between cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Private,
    Shared,
    SharedBy(usize),
}

/// A parsed `<section> <name> [shared|sharedby N]` device reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub section: String,
    pub name: String,
    pub sharing: Sharing,
}

impl Device {
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidDevice {
            spec: spec.to_string(),
        };
        let tokens: Vec<&str> = spec.split_whitespace().collect();
        let (section, name, rest) = match tokens.as_slice() {
            [section] => (*section, *section, &[][..]),
            [section, name, rest @ ..] => (*section, *name, rest),
            [] => return Err(invalid()),
        };
        let is_keyword = |token: &str| {
            token.eq_ignore_ascii_case("shared") || token.eq_ignore_ascii_case("sharedby")
        };
        if is_keyword(name) {
            // most likely a missing name
            return Err(invalid());
        }
        let sharing = match rest {
            [] => Sharing::Private,
            [shared] if shared.eq_ignore_ascii_case("shared") => Sharing::Shared,
            [shared, n] if shared.eq_ignore_ascii_case("sharedby") => match n.parse() {
                Ok(n) if n > 0 => Sharing::SharedBy(n),
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        };
        Ok(Self {
            section: section.to_string(),
            name: name.to_string(),
            sharing,
        })
    }

    /// Name of the instance serving `core`.
    #[must_use]
    pub fn instance_name(&self, core: usize) -> String {
        match self.sharing {
            Sharing::Private => format!("{}({})", self.name, core),
            Sharing::SharedBy(n) => format!("{}({})", self.name, core / n),
            Sharing::Shared => self.name.clone(),
        }
    }
}

/// The memory objects of a configured hierarchy.
#[derive(Debug)]
pub struct Hierarchy {
    objects: Vec<Object>,
    names: IndexMap<String, ObjectId>,
    caches: IndexMap<String, Arc<Mutex<CoherentCache>>>,
    cores: Vec<Vec<ObjectId>>,
}

impl Hierarchy {
    #[must_use]
    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> Object {
        Arc::clone(&self.objects[id.0])
    }

    /// Looks up an object by its instance name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<ObjectId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn cache(&self, name: &str) -> Option<Arc<Mutex<CoherentCache>>> {
        self.caches.get(name).map(Arc::clone)
    }

    /// Instance names in creation order.
    pub fn names(&self) -> impl Iterator<Item = (&str, ObjectId)> + '_ {
        self.names.iter().map(|(name, id)| (name.as_str(), *id))
    }

    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// First level devices of `core`, in configuration order.
    #[must_use]
    pub fn first_level(&self, core: usize) -> &[ObjectId] {
        &self.cores[core]
    }
}

/// Builds a [`Hierarchy`] from a configuration.
///
/// Shared devices are created once and found again by instance name.
#[derive(Debug)]
pub struct Builder<'a> {
    config: &'a Config,
    objects: Vec<Object>,
    names: IndexMap<String, ObjectId>,
    caches: IndexMap<String, Arc<Mutex<CoherentCache>>>,
    coherent: HashSet<ObjectId>,
    buses: Vec<ObjectId>,
    /// Lower cased instance name to the section and object it was created from.
    declared: HashMap<String, (String, ObjectId)>,
    in_progress: HashSet<ObjectId>,
    errors: Vec<Error>,
}

impl<'a> Builder<'a> {
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            objects: Vec::new(),
            names: IndexMap::new(),
            caches: IndexMap::new(),
            coherent: HashSet::new(),
            buses: Vec::new(),
            declared: HashMap::new(),
            in_progress: HashSet::new(),
            errors: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<Hierarchy, Errors> {
        self.config.validate()?;

        let config = self.config;
        let mut cores = Vec::with_capacity(config.cores);
        for core in 0..config.cores {
            let devices: Vec<ObjectId> = config
                .first_level
                .iter()
                .filter_map(|spec| self.declare(spec, core, "first_level"))
                .collect();
            cores.push(devices);
        }

        self.check_shared_buses();
        if !self.errors.is_empty() {
            return Err(Errors(self.errors));
        }
        self.add_routes();

        for (name, id) in &self.names {
            log::debug!("declared {name} as {id}");
        }
        Ok(Hierarchy {
            objects: self.objects,
            names: self.names,
            caches: self.caches,
            cores,
        })
    }

    /// Creates the device described by `spec` for `core`, or returns the
    /// existing instance.
    fn declare(&mut self, spec: &str, core: usize, by: &str) -> Option<ObjectId> {
        let device = match Device::parse(spec) {
            Ok(device) => device,
            Err(err) => {
                self.errors.push(err);
                return None;
            }
        };
        let config = self.config;
        let Some(section) = config.sections.get(&device.section) else {
            self.errors.push(Error::UnknownSection {
                section: device.section,
                by: by.to_string(),
            });
            return None;
        };

        let name = device.instance_name(core);
        if let Some((first, id)) = self.declared.get(&name.to_lowercase()) {
            if *first != device.section {
                self.errors.push(Error::NameClash {
                    name,
                    first: first.clone(),
                    second: device.section,
                });
                return None;
            }
            if self.in_progress.contains(id) {
                self.errors.push(Error::Cycle { name });
                return None;
            }
            return Some(*id);
        }

        let id = ObjectId(self.objects.len());
        let object: Object = match section {
            Section::Cache(cache) => {
                if cache.coherent {
                    self.coherent.insert(id);
                }
                let cache = Arc::new(Mutex::new(CoherentCache::new(id, &name, cache)));
                self.caches.insert(name.clone(), Arc::clone(&cache));
                cache
            }
            Section::Bus(bus) => {
                self.buses.push(id);
                Arc::new(Mutex::new(Bus::new(id, &name, bus)))
            }
            Section::Memory(memory) => Arc::new(Mutex::new(Memory::new(id, &name, memory))),
            Section::Dummy => Arc::new(Mutex::new(Dummy::new(id, &name))),
        };
        self.objects.push(object);
        self.names.insert(name.clone(), id);
        self.declared
            .insert(name.to_lowercase(), (device.section.clone(), id));

        match section.lower_level() {
            Some(lower) => {
                self.in_progress.insert(id);
                let lower = self.declare(lower, core, &device.section);
                self.in_progress.remove(&id);
                if let Some(lower) = lower {
                    self.link(id, lower);
                }
            }
            None if matches!(section, Section::Cache(_) | Section::Bus(_)) => {
                self.errors.push(Error::MissingLowerLevel { name });
            }
            None => {}
        }
        Some(id)
    }

    fn link(&mut self, upper: ObjectId, lower: ObjectId) {
        self.objects[lower.0].lock().router_mut().add_up_node(upper);
        self.objects[upper.0].lock().router_mut().add_down_node(lower);
    }

    /// Rejects buses shared by several coherent caches.
    ///
    /// Set states reaching a bus are broadcast, but the level below sees
    /// all of the bus' up nodes behind a single port and never invalidates
    /// one of them for a request of another.
    fn check_shared_buses(&mut self) {
        fn has_coherent(builder: &Builder<'_>, node: ObjectId) -> bool {
            if builder.coherent.contains(&node) {
                return true;
            }
            let up = builder.objects[node.0].lock().router().up_nodes().to_vec();
            up.into_iter().any(|up| has_coherent(builder, up))
        }

        for &bus in &self.buses {
            let up = self.objects[bus.0].lock().router().up_nodes().to_vec();
            let caches = up.into_iter().filter(|&node| has_coherent(self, node)).count();
            if caches > 1 {
                let name = self.objects[bus.0].lock().name().to_string();
                self.errors.push(Error::SharedBus { name, caches });
            }
        }
    }

    /// Every object learns which up position leads to each object above it.
    fn add_routes(&mut self) {
        let up: Vec<Vec<ObjectId>> = self
            .objects
            .iter()
            .map(|object| object.lock().router().up_nodes().to_vec())
            .collect();

        fn above(up: &[Vec<ObjectId>], node: ObjectId, out: &mut Vec<ObjectId>) {
            out.push(node);
            for &next in &up[node.0] {
                above(up, next, out);
            }
        }

        for (idx, object) in self.objects.iter().enumerate() {
            let mut object = object.lock();
            for (pos, &node) in up[idx].iter().enumerate() {
                let mut reachable = Vec::new();
                above(&up, node, &mut reachable);
                for node in reachable {
                    object.router_mut().add_route(node, pos);
                }
            }
        }
    }
}

/// Validates the configuration and builds its hierarchy.
pub fn build(config: &config::Config) -> Result<Hierarchy, Errors> {
    Builder::new(config).build()
}
