//! Subject and probe selection over a `<root>/<person>/<image>` dataset.

use std::{
    io,
    path::{Path, PathBuf},
};

use rand::{Rng, seq::IndexedRandom};

/// An image, identified by its path relative to the dataset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub person: String,
    pub path: PathBuf,
}

impl AsRef<Path> for Image {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub name: String,
    /// Images sorted by file name.
    pub images: Vec<Image>,
}

/// The people of a dataset, sorted by name.
#[derive(Debug, Clone)]
pub struct Dataset {
    people: Vec<Person>,
}

impl Dataset {
    /// Lists the dataset at `root`. Files directly below the root are
    /// ignored.
    pub fn open(root: &Path) -> io::Result<Self> {
        let mut people = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let mut files = Vec::new();
            for image in std::fs::read_dir(entry.path())? {
                let image = image?;
                if image.file_type()?.is_file() {
                    files.push(image.file_name().to_string_lossy().into_owned());
                }
            }
            files.sort();

            let images = files
                .into_iter()
                .map(|file| Image {
                    person: name.clone(),
                    path: Path::new(&name).join(file),
                })
                .collect();
            people.push(Person { name, images });
        }
        people.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self { people })
    }

    pub fn people(&self) -> &[Person] {
        &self.people
    }

    /// People with more than one image, `count` of them starting at `start`.
    pub fn subjects(&self, start: usize, count: usize) -> Vec<&Person> {
        self.people
            .iter()
            .filter(|person| person.images.len() > 1)
            .skip(start)
            .take(count)
            .collect()
    }

    /// Draws `count` distinct images of anyone but `excluded`.
    pub fn random_images_except<R: Rng + ?Sized>(
        &self,
        excluded: &str,
        count: usize,
        rng: &mut R,
    ) -> Vec<Image> {
        let pool: Vec<&Image> = self
            .people
            .iter()
            .filter(|person| person.name != excluded)
            .flat_map(|person| &person.images)
            .collect();

        pool.choose_multiple(rng, count)
            .map(|image| (*image).clone())
            .collect()
    }
}

/// Probes for one subject, given the reference image chosen for it: the
/// subject's other images followed by as many images of other people.
pub fn probes_for<R: Rng + ?Sized>(
    dataset: &Dataset,
    person: &Person,
    reference: &Image,
    rng: &mut R,
) -> Vec<Image> {
    let mut probes: Vec<Image> = person
        .images
        .iter()
        .filter(|image| *image != reference)
        .cloned()
        .collect();
    let others = dataset.random_images_except(&person.name, probes.len(), rng);
    probes.extend(others);
    probes
}
