//! Routing graph of one partition level
//!
//! Nodes live in index arenas owned by the level:
//! - `Inpnode`: one per input channel that feeds the level, holding its
//!   ring of input-block spectra
//! - `Macnode`: one per (input, output) pair, holding that pair's impulse
//!   partition spectra or a link to another pair's spectra
//! - `Outnode`: one per output channel, owning the list of its macnodes.
//!   Its triple overlap buffer is the level's `OutRing` for the channel.

use crate::fft::Bin;
use pconv_core::{ConvResult, try_filled};
use std::ops::{Index, IndexMut};

// ============ Arena ============

/// Slot arena with index reuse
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take();
        if value.is_some() {
            self.free.push(index);
        }
        value
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<usize> for Arena<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.get(index).expect("stale arena index")
    }
}

impl<T> IndexMut<usize> for Arena<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.get_mut(index).expect("stale arena index")
    }
}

// ============ Nodes ============

pub struct Inpnode {
    pub inp: usize,
    /// Spectra of the last `npar` input blocks, indexed by partition cursor
    pub ffta: Vec<Vec<Bin>>,
}

pub struct Macnode {
    /// Arena index of the feeding `Inpnode`
    pub inpn: usize,
    /// Impulse spectra per partition, allocated on first non-empty write
    pub fftb: Vec<Option<Vec<Bin>>>,
    /// Arena index of the macnode whose spectra this one shares
    pub link: Option<usize>,
}

pub struct Outnode {
    pub out: usize,
    pub macs: Vec<usize>,
}

// ============ NodeGraph ============

pub struct NodeGraph {
    npar: usize,
    spectrum_len: usize,
    pub inputs: Arena<Inpnode>,
    pub macs: Arena<Macnode>,
    pub outputs: Arena<Outnode>,
}

impl NodeGraph {
    pub fn new(npar: usize, spectrum_len: usize) -> Self {
        Self {
            npar,
            spectrum_len,
            inputs: Arena::new(),
            macs: Arena::new(),
            outputs: Arena::new(),
        }
    }

    pub fn find_inpnode(&self, inp: usize) -> Option<usize> {
        self.inputs.iter().find(|(_, x)| x.inp == inp).map(|(i, _)| i)
    }

    pub fn find_outnode(&self, out: usize) -> Option<usize> {
        self.outputs.iter().find(|(_, y)| y.out == out).map(|(i, _)| i)
    }

    pub fn find_macnode(&self, inp: usize, out: usize) -> Option<usize> {
        let y = self.find_outnode(out)?;
        self.outputs[y]
            .macs
            .iter()
            .copied()
            .find(|&m| self.inputs[self.macs[m].inpn].inp == inp)
    }

    /// Find or create the macnode for (inp, out), creating its input and
    /// output nodes as needed. Spectrum allocation happens before any node
    /// is inserted, so a failure leaves the graph unchanged.
    pub fn create_macnode(&mut self, inp: usize, out: usize) -> ConvResult<usize> {
        if let Some(m) = self.find_macnode(inp, out) {
            return Ok(m);
        }
        let x = match self.find_inpnode(inp) {
            Some(x) => x,
            None => {
                let ffta = (0..self.npar)
                    .map(|_| try_filled(self.spectrum_len, Bin::default()))
                    .collect::<ConvResult<Vec<_>>>()?;
                self.inputs.insert(Inpnode { inp, ffta })
            }
        };
        let y = match self.find_outnode(out) {
            Some(y) => y,
            None => self.outputs.insert(Outnode {
                out,
                macs: Vec::new(),
            }),
        };
        let m = self.macs.insert(Macnode {
            inpn: x,
            fftb: (0..self.npar).map(|_| None).collect(),
            link: None,
        });
        self.outputs[y].macs.push(m);
        Ok(m)
    }

    /// Remove the macnode for (inp, out). Input and output nodes left without
    /// macnodes are freed; macnodes linked to it lose their link.
    /// Returns false if there was nothing to remove.
    pub fn remove_macnode(&mut self, inp: usize, out: usize) -> bool {
        let Some(m) = self.find_macnode(inp, out) else {
            return false;
        };
        let Some(mac) = self.macs.remove(m) else {
            return false;
        };
        if let Some(y) = self.find_outnode(out) {
            let outnode = &mut self.outputs[y];
            outnode.macs.retain(|&k| k != m);
            if outnode.macs.is_empty() {
                self.outputs.remove(y);
            }
        }
        for (_, other) in self.macs.iter_mut() {
            if other.link == Some(m) {
                other.link = None;
            }
        }
        if !self.macs.iter().any(|(_, other)| other.inpn == mac.inpn) {
            self.inputs.remove(mac.inpn);
        }
        true
    }

    /// Spectra used by macnode `m`, following its link
    pub fn spectra(&self, m: usize) -> &[Option<Vec<Bin>>] {
        let mac = &self.macs[m];
        match mac.link.and_then(|l| self.macs.get(l)) {
            Some(src) => &src.fftb,
            None => &mac.fftb,
        }
    }

    /// Zero all input spectra
    pub fn reset_inputs(&mut self) {
        for (_, x) in self.inputs.iter_mut() {
            for spectrum in &mut x.ffta {
                spectrum.fill(Bin::default());
            }
        }
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.macs.clear();
        self.outputs.clear();
    }
}
